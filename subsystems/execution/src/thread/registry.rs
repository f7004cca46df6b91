//! # Thread Registry
//!
//! Thread allocation and teardown inside the kernel's thread table, and
//! maintenance of each environment's singly linked thread ring.

use lumen_hal::{AddressSpaceService, Clock, Protection, TrapFrame, VirtAddr};

use super::{Thread, ThreadStatus, WaitReason};
use crate::{
    context::Dispatch,
    environment::{EnvClass, EnvStatus},
    kernel::Kernel,
    scheduler::Priority,
    EnvId, ExecError, ExecResult, ThreadId, NTHR_PER_ENV,
};

/// Return value staged for a thread woken from a mutex wait: retry the lock
pub const MUTEX_RETRY: i64 = 1;

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Create a thread in `env` starting at `entry` with `arg` as its first
    /// argument
    pub fn create_thread(&mut self, env: EnvId, entry: VirtAddr, arg: u64) -> ExecResult<ThreadId> {
        self.create_thread_at(env, None, entry, arg)
    }

    /// [`Kernel::create_thread`] asking for the stack of local slot `local`
    pub fn create_thread_at(
        &mut self,
        env: EnvId,
        local: Option<usize>,
        entry: VirtAddr,
        arg: u64,
    ) -> ExecResult<ThreadId> {
        let env = self.env_id_or_self(env)?;
        self.spawn_thread(env, local, move |top| {
            let mut frame = TrapFrame::new(entry.as_u64(), top.as_u64());
            frame.set_arg0(arg);
            frame
        })
    }

    /// Allocate a thread, map its stack and append it to the ring.
    ///
    /// The head thread takes `requested_local` (0 when out of range). Later
    /// threads take it only if no sibling uses it, else the lowest free
    /// slot. `init` builds the trap frame from the stack top.
    pub(crate) fn spawn_thread(
        &mut self,
        env_id: EnvId,
        requested_local: Option<usize>,
        init: impl FnOnce(VirtAddr) -> TrapFrame,
    ) -> ExecResult<ThreadId> {
        let env = self.envs.get(env_id).ok_or(ExecError::BadEnv)?;
        let space = env.space;

        let local = if env.thread_head.is_none() {
            requested_local.filter(|&l| l < NTHR_PER_ENV).unwrap_or(0)
        } else {
            let mut used = [false; NTHR_PER_ENV];
            for tid in self.ring(env_id) {
                used[tid.local()] = true;
            }
            match requested_local {
                Some(l) if l < NTHR_PER_ENV && !used[l] => l,
                _ => used
                    .iter()
                    .position(|u| !u)
                    .ok_or(ExecError::NoFreeThread)?,
            }
        };

        if self.threads.is_full() {
            log::warn!("thread table exhausted");
            return Err(ExecError::NoFreeThread);
        }

        let (base, top) = self.config.stack_for(local);
        self.spaces
            .map_region(space, base, None, self.config.user_stack_size, Protection::user_stack())
            .map_err(|err| {
                log::warn!("{}: stack for slot {} not mapped: {}", env_id, local, err);
                ExecError::NoMemory
            })?;

        let frame = init(top);
        let priority = self.config.default_priority;
        let tail = self.ring(env_id).last().copied();
        let id = self
            .threads
            .alloc(
                |prev, slot| ThreadId::next(prev, slot, local, env_id),
                |id| Thread::new(id, frame, priority, base),
            )
            .ok_or(ExecError::NoFreeThread)?;

        match tail.and_then(|t| self.threads.get_mut(t)) {
            Some(last) => last.next = Some(id),
            None => self.env_mut(env_id)?.thread_head = Some(id),
        }
        let env = self.env_mut(env_id)?;
        env.thread_count += 1;
        if env.thread_current.is_none() {
            env.thread_current = Some(id);
        }

        log::trace!("{}: new thread {} in slot {}, stack {}", env_id, id, local, base);
        Ok(id)
    }

    /// Destroy a thread.
    ///
    /// Unlinks it from the ring, unmaps its stack and frees its slot.
    /// Removing the last thread frees the environment too.
    pub fn destroy_thread(&mut self, id: ThreadId) -> ExecResult<()> {
        let id = self.thread_id_or_self(id)?;
        let thread = self.threads.get(id).ok_or(ExecError::BadThr)?;
        let next = thread.next;
        let stack_base = thread.stack_base;
        let env_id = id.env();

        let Some(env) = self.envs.get(env_id) else {
            panic!("thread {} belongs to nonexistent env {}", id, env_id);
        };
        let space = env.space;

        if env.thread_head == Some(id) {
            self.env_mut(env_id)?.thread_head = next;
        } else {
            let pred = self
                .ring(env_id)
                .into_iter()
                .find(|&t| self.threads.get(t).and_then(|x| x.next) == Some(id));
            match pred.and_then(|p| self.threads.get_mut(p)) {
                Some(p) => p.next = next,
                None => {
                    log::error!("{}: thread {} not in ring", env_id, id);
                    return Err(ExecError::ThreadNotExists);
                }
            }
        }

        let env = self.env_mut(env_id)?;
        env.thread_count -= 1;
        if env.thread_current == Some(id) {
            env.thread_current = next.or(env.thread_head);
        }
        let remaining = env.thread_count;

        self.spaces
            .unmap_region(space, stack_base, self.config.user_stack_size);
        self.threads.free(id);
        if self.cpu.current_thread == Some(id) {
            self.cpu.current_thread = None;
        }
        log::trace!("{}: destroyed thread {}, {} left", env_id, id, remaining);

        if remaining == 0 {
            self.free_env(env_id);
        }
        Ok(())
    }

    /// Set a thread's fixed priority
    pub fn set_thread_priority(&mut self, id: ThreadId, priority: Priority) -> ExecResult<()> {
        self.thread_mut(id)?.priority = priority;
        Ok(())
    }

    /// Block the current thread
    pub(crate) fn block_current(&mut self, reason: WaitReason) -> ExecResult<ThreadId> {
        let id = self.cpu.current_thread.ok_or(ExecError::BadThr)?;
        self.thread_mut(id)?.block(reason);
        Ok(id)
    }

    /// Put the current thread to sleep for `ms` milliseconds
    pub fn sleep(&mut self, ms: u64) -> ExecResult<()> {
        let wake_at = self.clock.deadline_after_ms(ms);
        let id = self.block_current(WaitReason::Timer { wake_at })?;
        log::trace!("{} sleeps until {}", id, wake_at);
        Ok(())
    }

    /// Block the current thread until `target` exits
    pub fn join(&mut self, target: ThreadId) -> ExecResult<()> {
        let current = self.cpu.current_thread.ok_or(ExecError::BadThr)?;
        let target = self.thread(target)?.id;
        if target == current {
            return Err(ExecError::InvalidArgument);
        }
        self.block_current(WaitReason::Join(target))?;
        Ok(())
    }

    /// Re-evaluate a not-runnable thread's blocking condition.
    ///
    /// Does nothing unless the thread is not runnable.
    pub fn process_not_runnable_thread(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get(id) else {
            return;
        };
        if !thread.status.is_blocked() {
            return;
        }
        let wait = thread.wait;
        match wait {
            WaitReason::Join(target) => {
                if !self.threads.contains(target) {
                    log::trace!("{}: joined {} has exited", id, target);
                    self.wake_thread(id, 0);
                }
            }
            WaitReason::Mutex(mutex) => match self.mutexes.get(mutex).map(|m| m.locked) {
                None => {
                    log::debug!("{}: mutex {:?} vanished, destroying waiter", id, mutex);
                    if let Err(err) = self.destroy_thread(id) {
                        panic!("waiter {} lost from ring: {}", id, err);
                    }
                }
                Some(false) => self.wake_thread(id, MUTEX_RETRY),
                Some(true) => {}
            },
            WaitReason::Timer { wake_at } => {
                if self.clock.now() >= wake_at {
                    self.wake_thread(id, 0);
                }
            }
            WaitReason::Ipc | WaitReason::NotWaiting => {}
        }
    }

    pub(crate) fn wake_thread(&mut self, id: ThreadId, ret: i64) {
        if let Some(thread) = self.threads.get_mut(id) {
            thread.wake(ret);
        }
    }

    /// Commit `id` as the CPU's current thread and resume it.
    ///
    /// Switches environment bookkeeping and the address space when the
    /// thread belongs to another environment.
    pub fn run_thread(&mut self, id: ThreadId) -> Dispatch {
        let env_id = id.env();
        let now = self.clock.now();

        if self.cpu.current_env != Some(env_id) {
            if let Some(prev) = self.cpu.current_env.and_then(|p| self.envs.get_mut(p)) {
                if prev.status == EnvStatus::Running {
                    prev.status = EnvStatus::Runnable;
                }
            }
            self.cpu.current_env = Some(env_id);
            if let Some(env) = self.envs.get_mut(env_id) {
                env.runs += 1;
            }
        }

        let Some(env) = self.envs.get_mut(env_id) else {
            panic!("running thread {} of nonexistent env {}", id, env_id);
        };
        if env.status == EnvStatus::Runnable {
            env.status = EnvStatus::Running;
        }
        env.thread_current = Some(id);
        if env.class == EnvClass::RealTime {
            env.rt.last_launch = now;
        }
        let space = env.space;
        self.cpu.last_env_slot = Some(env_id.slot());

        if self.cpu.current_thread != Some(id) {
            if let Some(prev) = self.cpu.current_thread.and_then(|p| self.threads.get_mut(p)) {
                if prev.status == ThreadStatus::Running {
                    prev.set_status(ThreadStatus::Runnable);
                }
            }
            self.cpu.current_thread = Some(id);
            if let Some(thread) = self.threads.get_mut(id) {
                thread.runs += 1;
            }
            self.metrics.record_context_switch();
        }

        let Some(thread) = self.threads.get_mut(id) else {
            panic!("running stale thread {}", id);
        };
        debug_assert!(thread.status.is_runnable(), "running blocked thread {}", id);
        thread.set_status(ThreadStatus::Running);

        if self.spaces.current() != space {
            self.spaces.switch(space);
        }
        log::trace!("running {} of {}", id, env_id);
        Dispatch::Resume(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::kernel::tests::*;
    use crate::ExecError;

    fn entry() -> VirtAddr {
        VirtAddr::new(ENTRY)
    }

    #[test]
    fn test_requested_local_slot() {
        let mut k = kernel();
        let env = spawn(&mut k);
        let t5 = k.create_thread_at(env, Some(5), entry(), 0).unwrap();
        assert_eq!(t5.local(), 5);
        assert_eq!(
            k.thread(t5).unwrap().stack_base(),
            k.config().stack_for(5).0
        );

        // Taken: fall back to the lowest free slot
        let again = k.create_thread_at(env, Some(5), entry(), 0).unwrap();
        assert_eq!(again.local(), 1);
        let out_of_range = k.create_thread_at(env, Some(NTHR_PER_ENV), entry(), 0).unwrap();
        assert_eq!(out_of_range.local(), 2);
        assert_ring(&k, env);
    }

    #[test]
    #[should_panic(expected = "invalid transition")]
    fn test_invalid_status_transition_panics() {
        let mut k = kernel();
        let env = spawn(&mut k);
        let head = k.env(env).unwrap().thread_head().unwrap();
        let thread = k.threads.get_mut(head).unwrap();
        thread.set_status(ThreadStatus::Free);
        thread.set_status(ThreadStatus::Running);
    }

    /// Walking `thread_count` steps from the head visits every owned thread
    /// once and ends at a thread with no successor
    fn assert_ring(k: &SimKernel, env: EnvId) {
        let e = k.env(env).unwrap();
        let mut cursor = e.thread_head();
        let mut seen = Vec::new();
        for _ in 0..e.thread_count() {
            let id = cursor.expect("ring shorter than thread_count");
            assert!(!seen.contains(&id));
            seen.push(id);
            cursor = k.thread(id).unwrap().next();
        }
        assert_eq!(cursor, None);
        let owned: Vec<_> = k
            .thread_table()
            .iter()
            .filter(|(id, _)| id.env() == env)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(owned.len(), seen.len());
        assert!(owned.iter().all(|id| seen.contains(id)));
    }

    #[test]
    fn test_ring_and_stack_slots() {
        let mut k = kernel();
        let env = spawn(&mut k);
        let t1 = k.create_thread(env, entry(), 1).unwrap();
        let t2 = k.create_thread(env, entry(), 2).unwrap();
        assert_eq!((t1.local(), t2.local()), (1, 2));
        assert_ring(&k, env);

        let config = ExecConfig::new();
        let (base, top) = config.stack_for(2);
        assert_eq!(k.thread(t2).unwrap().frame().sp, top.as_u64());
        assert_eq!(k.thread(t2).unwrap().frame().regs[lumen_hal::cpu::reg::RDI], 2);
        let space = k.env(env).unwrap().space();
        assert!(k.spaces().is_mapped(space, base));

        // A freed slot is the lowest free one and gets reused
        k.destroy_thread(t1).unwrap();
        assert_ring(&k, env);
        assert!(!k.spaces().is_mapped(space, config.stack_for(1).0));
        let t3 = k.create_thread(env, entry(), 3).unwrap();
        assert_eq!(t3.local(), 1);
        assert_ring(&k, env);
        assert_eq!(k.ring(env).last(), Some(&t3));
    }

    #[test]
    fn test_destroy_head_moves_head_and_current() {
        let mut k = kernel();
        let (env, head) = spawn_running(&mut k);
        let t1 = k.create_thread(env, entry(), 0).unwrap();
        k.destroy_thread(head).unwrap();
        let e = k.env(env).unwrap();
        assert_eq!(e.thread_head(), Some(t1));
        assert_eq!(e.thread_current(), Some(t1));
        assert_eq!(k.current_thread(), None);
        assert_ring(&k, env);
    }

    #[test]
    fn test_destroy_last_thread_frees_env() {
        let mut k = kernel();
        let env = spawn(&mut k);
        let head = k.env(env).unwrap().thread_head().unwrap();
        k.destroy_thread(head).unwrap();
        assert_eq!(k.env_status_at(env.slot()), EnvStatus::Free);
        assert_eq!(k.env(env).err(), Some(ExecError::BadEnv));
        assert_eq!(k.thread(head).err(), Some(ExecError::BadThr));
    }

    #[test]
    fn test_stale_thread_id() {
        let mut k = kernel();
        let env = spawn(&mut k);
        let t = k.create_thread(env, entry(), 0).unwrap();
        k.destroy_thread(t).unwrap();
        let again = k.create_thread(env, entry(), 0).unwrap();
        assert_eq!(t.slot(), again.slot());
        assert_ne!(t, again);
        assert_eq!(k.destroy_thread(t), Err(ExecError::BadThr));
    }

    #[test]
    fn test_stack_map_failure() {
        let mut k = kernel();
        let env = spawn(&mut k);
        k.spaces_mut().fail_next_maps(1);
        assert_eq!(k.create_thread(env, entry(), 0), Err(ExecError::NoMemory));
        assert_eq!(k.env(env).unwrap().thread_count(), 1);
        assert_ring(&k, env);
    }

    #[test]
    fn test_run_thread_bookkeeping() {
        let mut k = kernel();
        let (a, ta) = spawn_running(&mut k);
        let b = spawn(&mut k);
        let tb = k.env(b).unwrap().thread_head().unwrap();
        assert_eq!(k.env(a).unwrap().status(), EnvStatus::Running);

        assert_eq!(k.run_thread(tb), Dispatch::Resume(tb));
        assert_eq!(k.env(a).unwrap().status(), EnvStatus::Runnable);
        assert_eq!(k.env(b).unwrap().status(), EnvStatus::Running);
        assert_eq!(k.thread(ta).unwrap().status(), ThreadStatus::Runnable);
        assert_eq!(k.thread(tb).unwrap().status(), ThreadStatus::Running);
        assert_eq!(k.thread(tb).unwrap().runs(), 1);
        assert_eq!(k.spaces().current(), k.env(b).unwrap().space());
        assert_eq!(k.cpu().last_env_slot(), Some(b.slot()));
        assert_eq!(k.metrics().context_switches(), 2);
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let mut k = kernel();
        let (_, head) = spawn_running(&mut k);
        k.sleep(5).unwrap();
        assert_eq!(k.thread(head).unwrap().status(), ThreadStatus::NotRunnable);

        k.clock().advance_ms(4);
        k.process_not_runnable_thread(head);
        assert_eq!(k.thread(head).unwrap().status(), ThreadStatus::NotRunnable);

        k.clock().advance_ms(1);
        k.process_not_runnable_thread(head);
        let t = k.thread(head).unwrap();
        assert_eq!(t.status(), ThreadStatus::Runnable);
        assert_eq!(t.wait_reason(), WaitReason::NotWaiting);
        assert_eq!(t.frame().return_value(), 0);
    }

    #[test]
    fn test_join_wakes_when_target_exits() {
        let mut k = kernel();
        let (env, head) = spawn_running(&mut k);
        let worker = k.create_thread(env, entry(), 0).unwrap();
        assert_eq!(k.join(head), Err(ExecError::InvalidArgument));
        k.join(worker).unwrap();

        k.process_not_runnable_thread(head);
        assert_eq!(k.thread(head).unwrap().status(), ThreadStatus::NotRunnable);

        k.destroy_thread(worker).unwrap();
        k.process_not_runnable_thread(head);
        assert_eq!(k.thread(head).unwrap().status(), ThreadStatus::Runnable);
    }

    #[test]
    fn test_process_not_runnable_ignores_runnable() {
        let mut k = kernel();
        let (_, head) = spawn_running(&mut k);
        k.frame_mut(head).unwrap().set_return(42);
        k.process_not_runnable_thread(head);
        assert_eq!(k.thread(head).unwrap().frame().return_value(), 42);
        assert_eq!(k.thread(head).unwrap().status(), ThreadStatus::Running);
    }
}
