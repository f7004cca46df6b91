//! # Scheduler
//!
//! Two-level decision: pick an environment, then a thread inside it.
//!
//! Real-time environments go first, ordered by slack (see [`realtime`]).
//! When none of them can run, usual environments are served round-robin
//! starting just after the one that ran last. Blocked entities met along
//! the way are re-polled, which is how sleeping, joining, mutex and IPC
//! waits end.

pub mod metrics;
pub mod priority;
pub mod realtime;

pub use priority::*;

use lumen_hal::{AddressSpaceService, Clock};

use crate::{
    context::{Dispatch, SwitchReason},
    environment::{EnvClass, EnvStatus},
    kernel::Kernel,
    EnvId, ThreadId, NENV,
};

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Timer interrupt: preempt the running thread
    pub fn tick(&mut self) -> Dispatch {
        self.metrics.record_tick();
        self.reschedule(SwitchReason::Preemption)
    }

    /// Pick what runs next after the current thread stops for `reason`
    pub fn reschedule(&mut self, reason: SwitchReason) -> Dispatch {
        match reason {
            SwitchReason::Yield => self.metrics.record_yield(),
            SwitchReason::Preemption => self.metrics.record_preemption(),
            SwitchReason::Blocked | SwitchReason::Exit => {}
        }
        log::trace!("reschedule: {:?}", reason);
        match reason {
            SwitchReason::Preemption => self.run_next(),
            SwitchReason::Yield => self.yield_now(),
            SwitchReason::Blocked | SwitchReason::Exit => self.schedule(),
        }
    }

    /// Voluntary yield: another thread of the running environment, else the
    /// next environment. The caller runs again only if nothing else can.
    pub fn yield_now(&mut self) -> Dispatch {
        self.account_current();
        if let (Some(env), Some(current)) = (self.cpu.current_env, self.cpu.current_thread) {
            let running = self
                .envs
                .get(env)
                .map_or(false, |e| e.status == EnvStatus::Running);
            if running {
                if let Some(thread) = self.pick_thread(env, Some(current)) {
                    return self.run_thread(thread);
                }
            }
        }
        self.run_next()
    }

    /// Prefer another thread of the running environment, else pick an
    /// environment with [`Kernel::run_next`]
    pub fn schedule(&mut self) -> Dispatch {
        self.account_current();
        if let (Some(env), Some(_)) = (self.cpu.current_env, self.cpu.current_thread) {
            let running = self
                .envs
                .get(env)
                .map_or(false, |e| e.status == EnvStatus::Running);
            if running {
                if let Some(thread) = self.select_thread(env) {
                    return self.run_thread(thread);
                }
            }
        }
        self.run_next()
    }

    /// Select an environment and one of its threads, and run it
    pub fn run_next(&mut self) -> Dispatch {
        self.account_current();
        let now = self.clock.now();

        let mut candidates = self.sweep_realtime(now);
        self.order_by_slack(&mut candidates, now);
        for slot in candidates {
            if let Some(thread) = self.runnable_thread_at(slot, EnvClass::RealTime) {
                log::trace!("real-time pick: slot {}", slot);
                return self.run_thread(thread);
            }
        }

        let start = self.cpu.last_env_slot.map_or(0, |s| s + 1);
        for k in 0..NENV {
            let slot = (start + k) % NENV;
            if let Some(thread) = self.runnable_thread_at(slot, EnvClass::Usual) {
                return self.run_thread(thread);
            }
        }

        self.halt()
    }

    /// Poll the environment in `slot` and pick its next thread, if it is of
    /// `class` and can run
    fn runnable_thread_at(&mut self, slot: usize, class: EnvClass) -> Option<ThreadId> {
        let id = self.envs.id_at(slot)?;
        if self.envs.get(id)?.class != class {
            return None;
        }
        self.process_not_runnable_env(id);
        if !self.envs.get(id)?.status.is_runnable() {
            return None;
        }
        self.select_thread(id)
    }

    /// Choose the thread to run inside `env`.
    ///
    /// Usual class: round-robin from the thread after the current one, the
    /// current thread considered last. Real-time class: the runnable thread
    /// with the strictly highest priority, earliest in the ring on ties.
    pub fn select_thread(&mut self, env: EnvId) -> Option<ThreadId> {
        self.pick_thread(env, None)
    }

    /// [`Kernel::select_thread`], never returning `skip`
    fn pick_thread(&mut self, env: EnvId, skip: Option<ThreadId>) -> Option<ThreadId> {
        let e = self.envs.get(env)?;
        let class = e.class;
        let current = e.thread_current;
        let ring = self.ring(env);

        match class {
            EnvClass::Usual => {
                let start = current
                    .and_then(|c| ring.iter().position(|&t| t == c))
                    .map_or(0, |i| i + 1);
                let n = ring.len();
                for k in 0..n {
                    let t = ring[(start + k) % n];
                    if Some(t) == skip {
                        continue;
                    }
                    self.process_not_runnable_thread(t);
                    if !self.envs.contains(env) {
                        return None;
                    }
                    if self.threads.get(t).map_or(false, |th| th.status.is_runnable()) {
                        return Some(t);
                    }
                }
                None
            }
            EnvClass::RealTime => {
                let mut best: Option<(ThreadId, Priority)> = None;
                for t in ring {
                    if Some(t) == skip {
                        continue;
                    }
                    self.process_not_runnable_thread(t);
                    if !self.envs.contains(env) {
                        return None;
                    }
                    let Some(th) = self.threads.get(t) else {
                        continue;
                    };
                    if th.status.is_runnable() && best.map_or(true, |(_, p)| th.priority > p) {
                        best = Some((t, th.priority));
                    }
                }
                best.map(|(t, _)| t)
            }
        }
    }

    /// Nothing can run: idle, or enter the monitor if no environment exists
    fn halt(&mut self) -> Dispatch {
        if let Some(t) = self.cpu.current_thread.take() {
            if let Some(thread) = self.threads.get_mut(t) {
                if thread.status == crate::ThreadStatus::Running {
                    thread.set_status(crate::ThreadStatus::Runnable);
                }
            }
        }
        if let Some(e) = self.cpu.current_env.take() {
            if let Some(env) = self.envs.get_mut(e) {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }

        if self.envs.is_empty() && self.config.monitor_on_empty {
            log::warn!("no environments in the system, entering monitor");
            return Dispatch::Monitor;
        }
        self.metrics.record_halt();
        log::trace!("nothing runnable, halting");
        Dispatch::Halt
    }
}
