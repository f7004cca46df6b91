//! # Kernel State
//!
//! The execution core as one value: the three handle tables, the CPU
//! context, and the collaborators it drives. Operations are spread over
//! `impl` blocks in the modules that own them.

use lumen_hal::{AddressSpaceService, Clock, TrapFrame};

use crate::{
    config::ExecConfig,
    context::Cpu,
    environment::{Env, EnvStatus},
    handle::HandleTable,
    mutex::KernelMutex,
    scheduler::metrics::SchedulerMetrics,
    thread::Thread,
    EnvId, ExecError, ExecResult, MutexId, ThreadId, NENV, NMUTEX, NTHR,
};

/// The execution core
#[derive(Debug)]
pub struct Kernel<A, C> {
    pub(crate) config: ExecConfig,
    pub(crate) envs: HandleTable<EnvId, Env>,
    pub(crate) threads: HandleTable<ThreadId, Thread>,
    pub(crate) mutexes: HandleTable<MutexId, KernelMutex>,
    pub(crate) cpu: Cpu,
    pub(crate) spaces: A,
    pub(crate) clock: C,
    pub(crate) metrics: SchedulerMetrics,
}

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Create a kernel with default configuration
    pub fn new(spaces: A, clock: C) -> Self {
        Self::with_config(ExecConfig::default(), spaces, clock)
    }

    /// Create a kernel with the given configuration
    pub fn with_config(config: ExecConfig, spaces: A, clock: C) -> Self {
        log::info!(
            "execution core: {} envs, {} threads, {} mutexes, budget policy {:?}",
            NENV,
            NTHR,
            NMUTEX,
            config.budget_policy
        );
        Self {
            config,
            envs: HandleTable::with_capacity(NENV),
            threads: HandleTable::with_capacity(NTHR),
            mutexes: HandleTable::with_capacity(NMUTEX),
            cpu: Cpu::new(),
            spaces,
            clock,
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Address space collaborator
    pub fn spaces(&self) -> &A {
        &self.spaces
    }

    /// Mutable address space collaborator
    pub fn spaces_mut(&mut self) -> &mut A {
        &mut self.spaces
    }

    /// Clock collaborator
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Scheduler metrics
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// CPU state
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Currently executing environment
    pub fn current_env(&self) -> Option<EnvId> {
        self.cpu.current_env
    }

    /// Currently executing thread
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.cpu.current_thread
    }

    // =========================================================================
    // Handle resolution
    // =========================================================================

    /// Expand the "caller's own" shorthand
    pub(crate) fn env_id_or_self(&self, id: EnvId) -> ExecResult<EnvId> {
        if id.is_self() {
            self.cpu.current_env.ok_or(ExecError::BadEnv)
        } else {
            Ok(id)
        }
    }

    /// Expand the "caller's own" shorthand
    pub(crate) fn thread_id_or_self(&self, id: ThreadId) -> ExecResult<ThreadId> {
        if id.is_self() {
            self.cpu.current_thread.ok_or(ExecError::BadThr)
        } else {
            Ok(id)
        }
    }

    /// Resolve an environment id
    pub fn env(&self, id: EnvId) -> ExecResult<&Env> {
        let id = self.env_id_or_self(id)?;
        self.envs.get(id).ok_or(ExecError::BadEnv)
    }

    pub(crate) fn env_mut(&mut self, id: EnvId) -> ExecResult<&mut Env> {
        let id = self.env_id_or_self(id)?;
        self.envs.get_mut(id).ok_or(ExecError::BadEnv)
    }

    /// Resolve a thread id
    pub fn thread(&self, id: ThreadId) -> ExecResult<&Thread> {
        let id = self.thread_id_or_self(id)?;
        self.threads.get(id).ok_or(ExecError::BadThr)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> ExecResult<&mut Thread> {
        let id = self.thread_id_or_self(id)?;
        self.threads.get_mut(id).ok_or(ExecError::BadThr)
    }

    /// Resolve a mutex id
    pub fn mutex(&self, id: MutexId) -> ExecResult<&KernelMutex> {
        self.mutexes.get(id).ok_or(ExecError::BadMutex)
    }

    /// Saved registers of a thread, for the trap path to fill in
    pub fn frame_mut(&mut self, id: ThreadId) -> ExecResult<&mut TrapFrame> {
        Ok(&mut self.thread_mut(id)?.frame)
    }

    /// Status of an environment table slot
    pub fn env_status_at(&self, slot: usize) -> EnvStatus {
        self.envs
            .id_at(slot)
            .and_then(|id| self.envs.get(id))
            .map_or(EnvStatus::Free, |env| env.status)
    }

    /// Environment table (read-only)
    pub fn env_table(&self) -> &HandleTable<EnvId, Env> {
        &self.envs
    }

    /// Thread table (read-only)
    pub fn thread_table(&self) -> &HandleTable<ThreadId, Thread> {
        &self.threads
    }

    /// Mutex table (read-only)
    pub fn mutex_table(&self) -> &HandleTable<MutexId, KernelMutex> {
        &self.mutexes
    }

    /// Permission check: `target` must be `caller` or its immediate child
    pub fn check_perm(&self, caller: EnvId, target: EnvId) -> ExecResult<()> {
        let env = self.env(target)?;
        if env.id == caller || env.parent == caller {
            Ok(())
        } else {
            log::debug!("{} may not act on {}", caller, env.id);
            Err(ExecError::BadEnv)
        }
    }

    /// Resolve `target` on behalf of the current environment, with the
    /// permission check applied
    pub(crate) fn env_for_caller(&self, target: EnvId) -> ExecResult<EnvId> {
        let caller = self.cpu.current_env.ok_or(ExecError::BadEnv)?;
        let target = self.env_id_or_self(target)?;
        self.check_perm(caller, target)?;
        Ok(target)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::environment::EnvSpec;
    use lumen_hal::hosted::{SimAddressSpaces, SimClock};
    use lumen_hal::VirtAddr;

    pub(crate) type SimKernel = Kernel<SimAddressSpaces, SimClock>;

    pub(crate) const ENTRY: u64 = 0x80_0000;

    pub(crate) fn kernel() -> SimKernel {
        Kernel::new(SimAddressSpaces::new(), SimClock::new(1000))
    }

    pub(crate) fn kernel_with(config: ExecConfig) -> SimKernel {
        Kernel::with_config(config, SimAddressSpaces::new(), SimClock::new(1000))
    }

    pub(crate) fn spawn(k: &mut SimKernel) -> EnvId {
        k.create_env(EnvSpec::new(VirtAddr::new(ENTRY))).unwrap()
    }

    /// Create an environment and make it the running one
    pub(crate) fn spawn_running(k: &mut SimKernel) -> (EnvId, ThreadId) {
        let env = spawn(k);
        let head = k.env(env).unwrap().thread_head().unwrap();
        k.run_thread(head);
        (env, head)
    }

    #[test]
    fn test_self_shorthand() {
        let mut k = kernel();
        assert_eq!(k.env(EnvId::SELF).err(), Some(ExecError::BadEnv));
        let (env, head) = spawn_running(&mut k);
        assert_eq!(k.env(EnvId::SELF).unwrap().id(), env);
        assert_eq!(k.thread(ThreadId::SELF).unwrap().id(), head);
    }

    #[test]
    fn test_check_perm_parent_child() {
        let mut k = kernel();
        let a = spawn(&mut k);
        let b = k
            .create_env(EnvSpec::new(VirtAddr::new(ENTRY)).with_parent(a))
            .unwrap();
        let c = spawn(&mut k);
        assert!(k.check_perm(a, a).is_ok());
        assert!(k.check_perm(a, b).is_ok());
        assert_eq!(k.check_perm(b, a), Err(ExecError::BadEnv));
        assert_eq!(k.check_perm(a, c), Err(ExecError::BadEnv));
    }
}
