//! # Real-Time Class
//!
//! Periodic environments with a deadline and a per-period budget, all in
//! clock ticks. Each scheduling pass sweeps the real-time environments:
//!
//! - one that is past its deadline without having finished its job is
//!   demoted to the usual class, and its deadline upcall (if any) is pushed
//!   onto the exception stack of its current thread;
//! - one waiting for its next period starts it once the period has elapsed;
//! - the rest are ordered by slack, the time left before the deadline once
//!   the remaining budget is spent. Least slack runs first.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use lumen_hal::{AddressSpaceService, Clock, Protection, UpcallFrame, VirtAddr, PAGE_SIZE};

use crate::{
    config::BudgetPolicy,
    environment::{EnvClass, EnvStatus, RealTimeState},
    kernel::Kernel,
    EnvId, ExecError, ExecResult, ThreadId, NENV,
};

impl RealTimeState {
    /// Ticks to spare at `now` if the remaining budget ran back to back
    pub fn slack(&self, now: u64) -> u64 {
        self.last_period_start
            .saturating_add(self.params.deadline)
            .saturating_sub(now)
            .saturating_sub(self.left_max_job_time)
    }
}

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// End the current job: the running real-time environment sleeps until
    /// its next period. No effect for the usual class.
    pub fn periodic_wait(&mut self) -> ExecResult<()> {
        let id = self.cpu.current_env.ok_or(ExecError::BadEnv)?;
        let env = self.env_mut(id)?;
        if env.class == EnvClass::RealTime {
            env.status = EnvStatus::PeriodicWaiting;
            log::trace!("{} waits for its next period", id);
        }
        Ok(())
    }

    /// Real-time environments in the order the scheduler would try them now
    pub fn realtime_order(&self) -> Vec<EnvId> {
        let now = self.clock.now();
        let mut slots: ArrayVec<usize, NENV> = self
            .envs
            .iter()
            .filter(|(_, env)| env.class == EnvClass::RealTime)
            .map(|(id, _)| id.slot())
            .collect();
        self.order_by_slack(&mut slots, now);
        slots.iter().filter_map(|&s| self.envs.id_at(s)).collect()
    }

    /// Charge the running real-time environment for the time since its
    /// last launch
    pub(crate) fn account_current(&mut self) {
        let now = self.clock.now();
        let policy = self.config.budget_policy;
        let Some(id) = self.cpu.current_env else {
            return;
        };
        let Some(env) = self.envs.get_mut(id) else {
            return;
        };
        if env.class != EnvClass::RealTime {
            return;
        }

        let rt = &mut env.rt;
        let elapsed = now.saturating_sub(rt.last_launch);
        rt.left_max_job_time = rt.left_max_job_time.saturating_sub(elapsed);
        rt.last_launch = now;

        if rt.left_max_job_time == 0 && policy == BudgetPolicy::Throttle && env.status.is_runnable()
        {
            env.status = EnvStatus::NotRunnable;
            env.rt.throttled = true;
            log::debug!("{} exhausted its budget, throttled", id);
        }
    }

    /// Demote overrunning environments, start due periods, and collect the
    /// slots of the remaining real-time environments
    pub(crate) fn sweep_realtime(&mut self, now: u64) -> ArrayVec<usize, NENV> {
        let mut candidates = ArrayVec::new();
        for slot in 0..NENV {
            let Some(id) = self.envs.id_at(slot) else {
                continue;
            };
            let Some(env) = self.envs.get_mut(id) else {
                continue;
            };
            if env.class != EnvClass::RealTime {
                continue;
            }

            let since_start = now.saturating_sub(env.rt.last_period_start);
            if since_start > env.rt.params.deadline && env.status != EnvStatus::PeriodicWaiting {
                self.deadline_overrun(id);
                continue;
            }

            if env.status == EnvStatus::PeriodicWaiting
                && (!env.rt.started || since_start > env.rt.params.period)
            {
                env.rt.started = true;
                env.rt.last_period_start = now;
                env.rt.left_max_job_time = env.rt.params.max_job_time;
                env.status = EnvStatus::Runnable;
                log::trace!("{} starts a new period at {}", id, now);
            }
            candidates.push(slot);
        }
        candidates
    }

    /// Stable insertion sort of environment slots by ascending slack
    pub(crate) fn order_by_slack(&self, slots: &mut [usize], now: u64) {
        let slack = |slot: usize| {
            self.envs
                .id_at(slot)
                .and_then(|id| self.envs.get(id))
                .map_or(u64::MAX, |env| env.rt.slack(now))
        };
        for i in 1..slots.len() {
            let item = slots[i];
            let key = slack(item);
            let mut j = i;
            while j > 0 && slack(slots[j - 1]) > key {
                slots[j] = slots[j - 1];
                j -= 1;
            }
            slots[j] = item;
        }
    }

    /// Demote `id` to the usual class and notify it through its upcall
    fn deadline_overrun(&mut self, id: EnvId) {
        self.metrics.record_deadline_overrun();
        let Some(env) = self.envs.get_mut(id) else {
            return;
        };
        env.class = EnvClass::Usual;
        if env.rt.throttled {
            env.rt.throttled = false;
            if env.status == EnvStatus::NotRunnable {
                env.status = EnvStatus::Runnable;
            }
        }
        let upcall = env.deadline_upcall;
        let thread = env.thread_current.or(env.thread_head);
        log::info!("{} missed its deadline, demoted to the usual class", id);

        if let (Some(entry), Some(thread)) = (upcall, thread) {
            match self.push_upcall(id, thread, entry) {
                Ok(()) => self.metrics.record_upcall(),
                Err(err) => log::warn!("{}: deadline upcall not delivered: {}", id, err),
            }
        }
    }

    /// Save `thread`'s registers on its exception stack and redirect it to
    /// `entry`
    fn push_upcall(&mut self, env: EnvId, thread: ThreadId, entry: VirtAddr) -> ExecResult<()> {
        let space = self.env(env)?.space;
        let top = self.config.exception_stack_for(thread.local());
        let page = top.sub(PAGE_SIZE as u64);
        if self
            .spaces
            .check_access(space, page, PAGE_SIZE, Protection::WRITE)
            .is_err()
        {
            self.spaces
                .map_region(space, page, None, PAGE_SIZE, Protection::user_stack())?;
        }

        let frame = self.thread(thread)?.frame;
        // Nested upcall: keep the frame already being handled
        let base = if (page.as_u64()..top.as_u64()).contains(&frame.sp) {
            frame.sp - 8
        } else {
            top.as_u64()
        };
        let sp = base
            .checked_sub(UpcallFrame::SIZE as u64)
            .filter(|&sp| sp >= page.as_u64())
            .ok_or(ExecError::NoMemory)?;
        self.spaces
            .write_bytes(space, VirtAddr::new(sp), &UpcallFrame::capture(&frame).to_bytes())?;

        let t = self.thread_mut(thread)?;
        t.frame.sp = sp;
        t.frame.ip = entry.as_u64();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::context::Dispatch;
    use crate::environment::RealTimeParams;
    use crate::kernel::tests::*;

    const UPCALL: u64 = 0x90_0000;

    fn realtime(k: &mut SimKernel, period: u64, deadline: u64, budget: u64) -> EnvId {
        let env = spawn(k);
        k.change_class(env, EnvClass::RealTime, RealTimeParams::new(period, deadline, budget))
            .unwrap();
        env
    }

    #[test]
    fn test_slack() {
        let rt = RealTimeState::start(RealTimeParams::new(1000, 200, 50), 100);
        assert_eq!(rt.slack(100), 150);
        assert_eq!(rt.slack(260), 0);
        assert_eq!(rt.slack(5000), 0);
    }

    #[test]
    fn test_least_slack_first() {
        let mut k = kernel();
        k.clock().set(1000);
        let e1 = realtime(&mut k, 10_000, 100, 30);
        let e2 = realtime(&mut k, 10_000, 200, 150);
        let e3 = realtime(&mut k, 10_000, 50, 10);
        assert_eq!(k.realtime_order(), vec![e3, e2, e1]);

        // Each job finishes at once; the next one in slack order follows
        for expected in [e3, e2, e1] {
            let thread = k.run_next().thread().unwrap();
            assert_eq!(thread.env(), expected);
            k.periodic_wait().unwrap();
        }
        assert_eq!(k.run_next(), Dispatch::Halt);
    }

    #[test]
    fn test_equal_slack_keeps_table_order() {
        let mut k = kernel();
        k.clock().set(10);
        let a = realtime(&mut k, 1000, 100, 10);
        let b = realtime(&mut k, 1000, 100, 10);
        assert_eq!(k.realtime_order(), vec![a, b]);
    }

    #[test]
    fn test_realtime_before_usual() {
        let mut k = kernel();
        k.clock().set(10);
        let usual = spawn(&mut k);
        let rt = realtime(&mut k, 1000, 500, 100);
        assert_eq!(k.run_next().thread().map(|t| t.env()), Some(rt));
        k.periodic_wait().unwrap();
        assert_eq!(k.run_next().thread().map(|t| t.env()), Some(usual));
    }

    #[test]
    fn test_next_period_restarts_job() {
        let mut k = kernel();
        k.clock().set(100);
        let env = realtime(&mut k, 1000, 500, 100);
        let head = k.env(env).unwrap().thread_head().unwrap();
        assert_eq!(k.run_next(), Dispatch::Resume(head));
        k.clock().advance(40);
        k.periodic_wait().unwrap();

        k.clock().advance(500);
        assert_eq!(k.run_next(), Dispatch::Halt);
        assert_eq!(k.env(env).unwrap().status(), EnvStatus::PeriodicWaiting);

        // Waiting past the deadline is not an overrun
        k.clock().advance(461);
        assert_eq!(k.run_next(), Dispatch::Resume(head));
        let rt = *k.env(env).unwrap().realtime();
        assert_eq!(rt.last_period_start, 1101);
        assert_eq!(rt.left_max_job_time, 100);
        assert_eq!(k.env(env).unwrap().class(), EnvClass::RealTime);
        assert_eq!(k.metrics().deadline_overruns(), 0);
    }

    #[test]
    fn test_period_starting_at_tick_zero_waits() {
        let mut k = kernel();
        let env = realtime(&mut k, 1000, 500, 100);
        let head = k.env(env).unwrap().thread_head().unwrap();
        assert_eq!(k.run_next(), Dispatch::Resume(head));
        k.clock().advance(10);
        k.periodic_wait().unwrap();
        k.clock().advance(10);

        assert_eq!(k.run_next(), Dispatch::Halt);
        assert_eq!(k.env(env).unwrap().status(), EnvStatus::PeriodicWaiting);
        assert_eq!(k.env(env).unwrap().realtime().last_period_start, 0);

        k.clock().set(1001);
        assert_eq!(k.run_next(), Dispatch::Resume(head));
        assert_eq!(k.env(env).unwrap().realtime().last_period_start, 1001);
    }

    #[test]
    fn test_unstarted_period_begins_at_once() {
        let mut k = kernel();
        k.clock().set(50);
        let env = realtime(&mut k, 1000, 500, 100);
        let head = k.env(env).unwrap().thread_head().unwrap();
        {
            let e = k.envs.get_mut(env).unwrap();
            e.rt.started = false;
            e.status = EnvStatus::PeriodicWaiting;
        }
        assert_eq!(k.run_next(), Dispatch::Resume(head));
        let rt = *k.env(env).unwrap().realtime();
        assert!(rt.started);
        assert_eq!(rt.last_period_start, 50);
    }

    #[test]
    fn test_budget_is_charged_while_running() {
        let mut k = kernel();
        k.clock().set(100);
        let env = realtime(&mut k, 1000, 500, 100);
        let head = k.env(env).unwrap().thread_head().unwrap();
        k.run_next();
        k.clock().advance(30);
        assert_eq!(k.tick(), Dispatch::Resume(head));
        assert_eq!(k.env(env).unwrap().realtime().left_max_job_time, 70);

        // Budget exhausted under the default policy keeps running
        k.clock().advance(200);
        assert_eq!(k.tick(), Dispatch::Resume(head));
        assert_eq!(k.env(env).unwrap().realtime().left_max_job_time, 0);
        assert_eq!(k.env(env).unwrap().status(), EnvStatus::Running);
    }

    #[test]
    fn test_throttle_until_deadline() {
        let mut k = kernel_with(ExecConfig::throttling());
        k.clock().set(100);
        let env = realtime(&mut k, 1000, 500, 100);
        let head = k.env(env).unwrap().thread_head().unwrap();
        k.run_next();

        k.clock().advance(100);
        assert_eq!(k.tick(), Dispatch::Halt);
        let e = k.env(env).unwrap();
        assert_eq!(e.status(), EnvStatus::NotRunnable);
        assert!(e.realtime().throttled);

        k.clock().advance(401);
        assert_eq!(k.tick(), Dispatch::Resume(head));
        let e = k.env(env).unwrap();
        assert_eq!(e.class(), EnvClass::Usual);
        assert!(!e.realtime().throttled);
    }

    #[test]
    fn test_overrun_demotes_and_upcalls_once() {
        let mut k = kernel();
        k.clock().set(100);
        let env = realtime(&mut k, 1000, 500, 100);
        k.set_deadline_upcall(env, Some(VirtAddr::new(UPCALL))).unwrap();
        let head = k.env(env).unwrap().thread_head().unwrap();
        assert_eq!(k.run_next(), Dispatch::Resume(head));
        let saved = *k.thread(head).unwrap().frame();

        k.clock().advance(600);
        assert_eq!(k.tick(), Dispatch::Resume(head));
        assert_eq!(k.env(env).unwrap().class(), EnvClass::Usual);
        assert_eq!(k.metrics().deadline_overruns(), 1);
        assert_eq!(k.metrics().upcalls(), 1);

        let top = k.config().exception_stack_for(head.local());
        let frame = k.thread(head).unwrap().frame();
        assert_eq!(frame.ip, UPCALL);
        assert_eq!(frame.sp, top.as_u64() - UpcallFrame::SIZE as u64);

        let space = k.env(env).unwrap().space();
        let mut buf = [0u8; UpcallFrame::SIZE];
        k.spaces()
            .read_bytes(space, VirtAddr::new(frame.sp), &mut buf)
            .unwrap();
        let pushed = UpcallFrame::from_bytes(&buf);
        assert_eq!(pushed.ip, saved.ip);
        assert_eq!(pushed.sp, saved.sp);

        k.clock().advance(600);
        k.tick();
        assert_eq!(k.metrics().deadline_overruns(), 1);
        assert_eq!(k.metrics().upcalls(), 1);
    }

    #[test]
    fn test_nested_upcall_stacks_below_previous_frame() {
        let mut k = kernel();
        k.clock().set(100);
        let env = realtime(&mut k, 1000, 500, 100);
        k.set_deadline_upcall(env, Some(VirtAddr::new(UPCALL))).unwrap();
        let head = k.env(env).unwrap().thread_head().unwrap();
        k.run_next();
        k.clock().advance(600);
        k.tick();
        let first = k.thread(head).unwrap().frame().sp;

        // Back to real time while still in the handler
        k.change_class(env, EnvClass::RealTime, RealTimeParams::new(1000, 500, 100))
            .unwrap();
        k.clock().advance(600);
        k.tick();
        let second = k.thread(head).unwrap().frame().sp;
        assert_eq!(second, first - 8 - UpcallFrame::SIZE as u64);
        assert_eq!(k.metrics().upcalls(), 2);
    }

    #[test]
    fn test_overrun_without_upcall() {
        let mut k = kernel();
        k.clock().set(100);
        let env = realtime(&mut k, 1000, 500, 100);
        let head = k.env(env).unwrap().thread_head().unwrap();
        k.run_next();
        let before = *k.thread(head).unwrap().frame();
        k.clock().advance(501);
        assert_eq!(k.tick(), Dispatch::Resume(head));
        assert_eq!(k.env(env).unwrap().class(), EnvClass::Usual);
        assert_eq!(*k.thread(head).unwrap().frame(), before);
        assert_eq!(k.metrics().upcalls(), 0);
    }
}
