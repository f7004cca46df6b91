//! # Environment Management
//!
//! Environments are the protection domains of the kernel. Each one owns an
//! address space and a ring of threads; real-time environments also carry
//! period, deadline and budget bookkeeping consumed by the scheduler.

use alloc::vec::Vec;

use lumen_hal::{AddressSpaceService, Clock, SpaceId, TrapFrame, VirtAddr};

use crate::{
    ipc::Mailbox, kernel::Kernel, EnvId, ExecError, ExecResult, MutexId, ThreadId, NTHR_PER_ENV,
};

/// Environment status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    /// Slot is on the free stack
    Free = 0,
    /// Being torn down
    Dying = 1,
    /// Ready to run
    Runnable = 2,
    /// Currently running
    Running = 3,
    /// Blocked (IPC, freshly forked, throttled)
    NotRunnable = 4,
    /// Real-time job finished, waiting for its next period
    PeriodicWaiting = 5,
}

impl EnvStatus {
    /// Convert from the syscall encoding
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            5 => Some(Self::PeriodicWaiting),
            _ => None,
        }
    }

    /// Convert to the syscall encoding
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Check if the environment can be picked by the scheduler
    pub fn is_runnable(self) -> bool {
        matches!(self, EnvStatus::Runnable | EnvStatus::Running)
    }
}

/// Scheduling class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum EnvClass {
    /// Best-effort round-robin
    #[default]
    Usual = 0,
    /// Deadline-driven
    RealTime = 1,
}

impl EnvClass {
    /// Convert from the syscall encoding
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Usual),
            1 => Some(Self::RealTime),
            _ => None,
        }
    }
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvType {
    /// Kernel-resident task
    Kernel,
    /// Ordinary user program
    #[default]
    User,
    /// File system server
    Fs,
}

/// Real-time parameters, in clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RealTimeParams {
    /// Length of one period
    pub period: u64,
    /// Deadline relative to the period start
    pub deadline: u64,
    /// Budget of one job
    pub max_job_time: u64,
}

impl RealTimeParams {
    /// Create parameters from tick counts
    pub const fn new(period: u64, deadline: u64, max_job_time: u64) -> Self {
        Self {
            period,
            deadline,
            max_job_time,
        }
    }
}

/// Real-time bookkeeping of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RealTimeState {
    /// Installed parameters
    pub params: RealTimeParams,
    /// Budget left in the current period
    pub left_max_job_time: u64,
    /// Start of the current period
    pub last_period_start: u64,
    /// A period has been started since the parameters were installed
    pub started: bool,
    /// When the environment was last resumed
    pub last_launch: u64,
    /// Parked because the budget ran out
    pub throttled: bool,
}

impl RealTimeState {
    /// State at the start of a fresh period
    pub fn start(params: RealTimeParams, now: u64) -> Self {
        Self {
            params,
            left_max_job_time: params.max_job_time,
            last_period_start: now,
            last_launch: now,
            started: true,
            throttled: false,
        }
    }
}

/// An environment
#[derive(Debug)]
pub struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent: EnvId,
    pub(crate) env_type: EnvType,
    pub(crate) status: EnvStatus,
    pub(crate) class: EnvClass,
    pub(crate) space: SpaceId,
    pub(crate) thread_head: Option<ThreadId>,
    pub(crate) thread_current: Option<ThreadId>,
    pub(crate) thread_count: usize,
    pub(crate) mailbox: Mailbox,
    pub(crate) rt: RealTimeState,
    pub(crate) deadline_upcall: Option<VirtAddr>,
    pub(crate) runs: u64,
}

impl Env {
    fn new(id: EnvId, spec: &EnvSpec, space: SpaceId, now: u64) -> Self {
        let (class, rt) = match spec.realtime {
            Some(params) => (EnvClass::RealTime, RealTimeState::start(params, now)),
            None => (EnvClass::Usual, RealTimeState::default()),
        };
        Self {
            id,
            parent: spec.parent,
            env_type: spec.env_type,
            status: EnvStatus::Runnable,
            class,
            space,
            thread_head: None,
            thread_current: None,
            thread_count: 0,
            mailbox: Mailbox::default(),
            rt,
            deadline_upcall: None,
            runs: 0,
        }
    }

    /// Environment id
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Parent id (0 for none)
    pub fn parent(&self) -> EnvId {
        self.parent
    }

    /// Environment type
    pub fn env_type(&self) -> EnvType {
        self.env_type
    }

    /// Current status
    pub fn status(&self) -> EnvStatus {
        self.status
    }

    /// Scheduling class
    pub fn class(&self) -> EnvClass {
        self.class
    }

    /// Owned address space
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// First thread of the ring
    pub fn thread_head(&self) -> Option<ThreadId> {
        self.thread_head
    }

    /// Thread that runs when this environment is picked
    pub fn thread_current(&self) -> Option<ThreadId> {
        self.thread_current
    }

    /// Number of threads in the ring
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// IPC mailbox
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Real-time bookkeeping
    pub fn realtime(&self) -> &RealTimeState {
        &self.rt
    }

    /// Installed deadline-exceeded upcall
    pub fn deadline_upcall(&self) -> Option<VirtAddr> {
        self.deadline_upcall
    }

    /// Times this environment has been switched to
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

/// Parameters of a new environment
#[derive(Debug, Clone)]
pub struct EnvSpec {
    /// Parent environment (0 for none)
    pub parent: EnvId,
    /// Environment type
    pub env_type: EnvType,
    /// Real-time parameters, `None` for the usual class
    pub realtime: Option<RealTimeParams>,
    /// Relocated entry point supplied by the loader
    pub entry: VirtAddr,
    /// First argument of the head thread
    pub arg: u64,
    /// In-environment slot of the head thread
    pub local_slot: usize,
}

impl EnvSpec {
    /// A usual-class user environment starting at `entry`
    pub fn new(entry: VirtAddr) -> Self {
        Self {
            parent: EnvId::SELF,
            env_type: EnvType::User,
            realtime: None,
            entry,
            arg: 0,
            local_slot: 0,
        }
    }

    /// Set the parent
    pub fn with_parent(mut self, parent: EnvId) -> Self {
        self.parent = parent;
        self
    }

    /// Set the type
    pub fn with_type(mut self, env_type: EnvType) -> Self {
        self.env_type = env_type;
        self
    }

    /// Make the environment real-time
    pub fn realtime(mut self, params: RealTimeParams) -> Self {
        self.realtime = Some(params);
        self
    }

    /// Set the head thread argument
    pub fn with_arg(mut self, arg: u64) -> Self {
        self.arg = arg;
        self
    }

    /// Place the head thread in local slot `slot`
    pub fn with_local_slot(mut self, slot: usize) -> Self {
        self.local_slot = slot;
        self
    }
}

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Create an environment and its head thread
    pub fn create_env(&mut self, spec: EnvSpec) -> ExecResult<EnvId> {
        let entry = spec.entry;
        let arg = spec.arg;
        let local = spec.local_slot;
        self.create_env_with(spec, local, move |top| {
            let mut frame = TrapFrame::new(entry.as_u64(), top.as_u64());
            frame.set_arg0(arg);
            frame
        })
    }

    fn create_env_with(
        &mut self,
        spec: EnvSpec,
        local: usize,
        init: impl FnOnce(VirtAddr) -> TrapFrame,
    ) -> ExecResult<EnvId> {
        if self.envs.is_full() {
            log::warn!("environment table exhausted");
            return Err(ExecError::NoFreeEnv);
        }
        let space = self.spaces.create().map_err(|_| ExecError::NoMemory)?;
        let now = self.clock.now();
        let id = self
            .envs
            .alloc(EnvId::next, |id| Env::new(id, &spec, space, now))
            .ok_or(ExecError::NoFreeEnv)?;

        if let Err(err) = self.spawn_thread(id, Some(local), init) {
            self.envs.free(id);
            self.spaces.release(space);
            return Err(err);
        }

        log::debug!(
            "new env {} (parent {}, {:?}, {:?})",
            id,
            spec.parent,
            spec.env_type,
            if spec.realtime.is_some() { EnvClass::RealTime } else { EnvClass::Usual }
        );
        Ok(id)
    }

    /// Fork the current environment.
    ///
    /// The child's head thread takes the parent's current thread slot and a
    /// copy of its registers with a zero return value. The child starts not
    /// runnable; the parent releases it with [`Kernel::set_env_status`].
    pub fn exofork(&mut self) -> ExecResult<EnvId> {
        let parent_thread = self.cpu.current_thread.ok_or(ExecError::BadThr)?;
        let parent = self.env(EnvId::SELF)?;
        let parent_id = parent.id;
        let env_type = parent.env_type;
        let mut frame = self.thread(parent_thread)?.frame;
        frame.set_return(0);

        let spec = EnvSpec::new(VirtAddr::new(frame.ip))
            .with_parent(parent_id)
            .with_type(env_type);
        let child = self.create_env_with(spec, parent_thread.local(), move |_| frame)?;
        self.env_mut(child)?.status = EnvStatus::NotRunnable;
        log::debug!("{} forked {}", parent_id, child);
        Ok(child)
    }

    /// Destroy an environment: every thread, then the address space
    pub fn destroy_env(&mut self, id: EnvId) -> ExecResult<()> {
        let id = self.env(id)?.id;
        log::debug!("destroying env {}", id);
        self.env_mut(id)?.status = EnvStatus::Dying;

        let ring = self.ring(id);
        if ring.is_empty() {
            self.free_env(id);
            return Ok(());
        }
        for thread in ring {
            if let Err(err) = self.destroy_thread(thread) {
                panic!("env {}: thread {} lost from ring: {}", id, thread, err);
            }
        }
        debug_assert!(!self.envs.contains(id));
        Ok(())
    }

    /// Return a thread-less environment to the free stack
    pub(crate) fn free_env(&mut self, id: EnvId) {
        let Some(env) = self.envs.free(id) else {
            return;
        };
        self.spaces.release(env.space);

        let owned: Vec<MutexId> = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.owner_env == id)
            .map(|(mid, _)| mid)
            .collect();
        for mutex in owned {
            self.mutexes.free(mutex);
        }

        if self.cpu.current_env == Some(id) {
            self.cpu.current_env = None;
        }
        log::debug!("freed env {} after {} runs", id, env.runs);
    }

    /// Set an environment runnable or not runnable
    pub fn set_env_status(&mut self, id: EnvId, status: EnvStatus) -> ExecResult<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(ExecError::InvalidArgument);
        }
        let env = self.env_mut(id)?;
        env.status = status;
        Ok(())
    }

    /// Switch an environment between the usual and real-time classes.
    ///
    /// Entering the real-time class restarts the period clock.
    pub fn change_class(
        &mut self,
        id: EnvId,
        class: EnvClass,
        params: RealTimeParams,
    ) -> ExecResult<()> {
        let now = self.clock.now();
        let env = self.env_mut(id)?;
        match class {
            EnvClass::RealTime => {
                if params.period == 0 || params.deadline == 0 {
                    return Err(ExecError::InvalidArgument);
                }
                env.rt = RealTimeState::start(params, now);
            }
            EnvClass::Usual => {
                if env.rt.throttled && env.status == EnvStatus::NotRunnable {
                    env.status = EnvStatus::Runnable;
                }
                if env.status == EnvStatus::PeriodicWaiting {
                    env.status = EnvStatus::Runnable;
                }
                env.rt = RealTimeState::default();
            }
        }
        env.class = class;
        log::debug!("{} is now {:?} {:?}", env.id, class, params);
        Ok(())
    }

    /// Install (or clear, with `None`) the deadline-exceeded upcall
    pub fn set_deadline_upcall(&mut self, id: EnvId, entry: Option<VirtAddr>) -> ExecResult<()> {
        if let Some(va) = entry {
            if va >= self.spaces.max_user_address() {
                return Err(ExecError::InvalidArgument);
            }
        }
        self.env_mut(id)?.deadline_upcall = entry;
        Ok(())
    }

    /// Re-evaluate a not-runnable environment's blocking condition
    pub fn process_not_runnable_env(&mut self, id: EnvId) {
        let Some(env) = self.envs.get(id) else {
            return;
        };
        if env.status != EnvStatus::NotRunnable {
            return;
        }
        if env.mailbox.is_active() {
            let outcome = self.poll_timed(id);
            log::trace!("{} ipc poll: {:?}", id, outcome);
        }
    }

    /// Threads of an environment in ring order
    pub fn ring(&self, id: EnvId) -> Vec<ThreadId> {
        let mut out = Vec::new();
        let Some(env) = self.envs.get(id) else {
            return out;
        };
        let mut cursor = env.thread_head;
        while let Some(tid) = cursor {
            if out.len() > NTHR_PER_ENV {
                panic!("env {}: thread ring does not terminate", id);
            }
            out.push(tid);
            cursor = self.threads.get(tid).and_then(|t| t.next);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::kernel::tests::*;
    use crate::thread::ThreadStatus;

    #[test]
    fn test_create_env_has_head_thread() {
        let mut k = kernel();
        let env = spawn(&mut k);
        let e = k.env(env).unwrap();
        assert_eq!(e.status(), EnvStatus::Runnable);
        assert_eq!(e.class(), EnvClass::Usual);
        assert_eq!(e.thread_count(), 1);
        let head = e.thread_head().unwrap();
        assert_eq!(e.thread_current(), Some(head));
        assert_eq!(head.env(), env);
        assert_eq!(head.local(), 0);

        let t = k.thread(head).unwrap();
        assert_eq!(t.status(), ThreadStatus::Runnable);
        assert_eq!(t.frame().ip, ENTRY);
        assert_eq!(t.frame().sp, ExecConfig::USER_STACK_TOP);
        assert_eq!(k.spaces().live_spaces(), 1);
    }

    #[test]
    fn test_env_slots_partition() {
        let mut k = kernel();
        let a = spawn(&mut k);
        let b = spawn(&mut k);
        let c = spawn(&mut k);
        k.destroy_env(b).unwrap();

        for slot in 0..crate::NENV {
            let free = k.env_table().free_slots().contains(&slot);
            let live = k.env_status_at(slot) != EnvStatus::Free;
            assert!(free ^ live);
        }
        assert_eq!(k.env_table().ids(), vec![a, c]);
    }

    #[test]
    fn test_destroy_env_releases_everything() {
        let mut k = kernel();
        let (env, _) = spawn_running(&mut k);
        k.create_thread(env, VirtAddr::new(ENTRY), 0).unwrap();
        let space = k.env(env).unwrap().space();
        let m = k.create_mutex(env).unwrap();

        k.destroy_env(env).unwrap();
        assert_eq!(k.env(env).err(), Some(ExecError::BadEnv));
        assert_eq!(k.env_status_at(env.slot()), EnvStatus::Free);
        assert_eq!(k.thread_table().len(), 0);
        assert_eq!(k.mutex(m).err(), Some(ExecError::BadMutex));
        assert_eq!(k.spaces().mapped_pages(space), 0);
        assert_eq!(k.spaces().live_spaces(), 0);
        assert_eq!(k.current_env(), None);
        assert_eq!(k.current_thread(), None);
    }

    #[test]
    fn test_stale_env_id_after_reuse() {
        let mut k = kernel();
        let old = spawn(&mut k);
        k.destroy_env(old).unwrap();
        let new = spawn(&mut k);
        assert_eq!(old.slot(), new.slot());
        assert_ne!(old, new);
        assert_eq!(k.env(old).err(), Some(ExecError::BadEnv));
        assert!(k.env(new).is_ok());
    }

    #[test]
    fn test_exofork() {
        let mut k = kernel();
        let (parent, head) = spawn_running(&mut k);
        k.frame_mut(head).unwrap().set_return(77);
        k.frame_mut(head).unwrap().ip = 0x1234;

        let child = k.exofork().unwrap();
        let c = k.env(child).unwrap();
        assert_eq!(c.parent(), parent);
        assert_eq!(c.status(), EnvStatus::NotRunnable);
        let child_head = c.thread_head().unwrap();
        assert_eq!(child_head.local(), head.local());
        let frame = k.thread(child_head).unwrap().frame();
        assert_eq!(frame.return_value(), 0);
        assert_eq!(frame.ip, 0x1234);

        k.set_env_status(child, EnvStatus::Runnable).unwrap();
        assert_eq!(k.env(child).unwrap().status(), EnvStatus::Runnable);
        assert_eq!(
            k.set_env_status(child, EnvStatus::Running),
            Err(ExecError::InvalidArgument)
        );
    }

    #[test]
    fn test_change_class_round_trip() {
        let mut k = kernel();
        let env = spawn(&mut k);
        k.clock().advance(500);
        let params = RealTimeParams::new(1000, 400, 100);
        k.change_class(env, EnvClass::RealTime, params).unwrap();
        let rt = *k.env(env).unwrap().realtime();
        assert_eq!(rt.params, params);
        assert_eq!(rt.left_max_job_time, 100);
        assert_eq!(rt.last_period_start, 500);

        k.change_class(env, EnvClass::Usual, RealTimeParams::default()).unwrap();
        assert_eq!(k.env(env).unwrap().class(), EnvClass::Usual);
        assert_eq!(
            k.change_class(env, EnvClass::RealTime, RealTimeParams::new(0, 1, 1)),
            Err(ExecError::InvalidArgument)
        );
    }

    #[test]
    fn test_head_thread_failure_rolls_back() {
        let mut k = kernel();
        k.spaces_mut().fail_next_maps(1);
        assert_eq!(
            k.create_env(EnvSpec::new(VirtAddr::new(ENTRY))),
            Err(ExecError::NoMemory)
        );
        assert_eq!(k.env_table().len(), 0);
        assert_eq!(k.spaces().live_spaces(), 0);
    }
}
