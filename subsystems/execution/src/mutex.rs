//! # Kernel Mutexes
//!
//! Binary locks handed out to user-space thread libraries. The kernel never
//! blocks on contention: `lock` fails with [`ExecError::MutexLocked`] and
//! the caller parks its thread on the mutex, to be re-polled by the
//! scheduler once the mutex is unlocked.

use lumen_hal::{AddressSpaceService, Clock};

use crate::{
    kernel::Kernel, thread::WaitReason, EnvId, ExecError, ExecResult, MutexId, ThreadId,
};

/// A kernel mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelMutex {
    pub(crate) id: MutexId,
    pub(crate) owner_env: EnvId,
    pub(crate) locked: bool,
    pub(crate) owner_thread: Option<ThreadId>,
}

impl KernelMutex {
    fn new(id: MutexId, owner_env: EnvId) -> Self {
        Self {
            id,
            owner_env,
            locked: false,
            owner_thread: None,
        }
    }

    /// Mutex id
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Environment that created the mutex
    pub fn owner_env(&self) -> EnvId {
        self.owner_env
    }

    /// Whether the mutex is held
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Holder, meaningful only while locked
    pub fn owner_thread(&self) -> Option<ThreadId> {
        self.owner_thread
    }
}

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Reserve an unlocked mutex for `owner`
    pub fn create_mutex(&mut self, owner: EnvId) -> ExecResult<MutexId> {
        let owner = self.env(owner)?.id;
        let id = self
            .mutexes
            .alloc(MutexId::next, |id| KernelMutex::new(id, owner))
            .ok_or(ExecError::NoFreeMutex)?;
        log::trace!("{}: new mutex {:?}", owner, id);
        Ok(id)
    }

    /// Release a mutex regardless of its lock state
    pub fn destroy_mutex(&mut self, id: MutexId) -> ExecResult<()> {
        let mutex = self.mutexes.free(id).ok_or(ExecError::BadMutex)?;
        if mutex.locked {
            log::debug!("mutex {:?} destroyed while held by {:?}", id, mutex.owner_thread);
        }
        Ok(())
    }

    /// Take the mutex for `thread`.
    ///
    /// Re-locking by the holder succeeds without effect. A mutex held by
    /// another thread yields [`ExecError::MutexLocked`].
    pub fn lock_mutex(&mut self, id: MutexId, thread: ThreadId) -> ExecResult<()> {
        let mutex = self.mutexes.get_mut(id).ok_or(ExecError::BadMutex)?;
        if mutex.locked {
            if mutex.owner_thread == Some(thread) {
                return Ok(());
            }
            return Err(ExecError::MutexLocked);
        }
        mutex.locked = true;
        mutex.owner_thread = Some(thread);
        Ok(())
    }

    /// Release the mutex; waiters notice on their next poll
    pub fn unlock_mutex(&mut self, id: MutexId) -> ExecResult<()> {
        let mutex = self.mutexes.get_mut(id).ok_or(ExecError::BadMutex)?;
        mutex.locked = false;
        Ok(())
    }

    /// Try the mutex for the current thread, parking it on contention.
    ///
    /// Returns `true` if the lock was taken, `false` if the thread now
    /// waits on the mutex.
    pub fn block_on_mutex(&mut self, id: MutexId) -> ExecResult<bool> {
        let current = self.cpu.current_thread.ok_or(ExecError::BadThr)?;
        match self.lock_mutex(id, current) {
            Ok(()) => Ok(true),
            Err(ExecError::MutexLocked) => {
                self.block_current(WaitReason::Mutex(id))?;
                log::trace!("{} waits on mutex {:?}", current, id);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
