//! # User Mutexes
//!
//! A kernel mutex plus a side table recording the holder and, for the
//! recursive kind, the lock depth. The side table sits behind a spin lock:
//! a timer interrupt may preempt a thread between its non-atomic steps,
//! and the next thread must never observe a half-updated owner.
//!
//! Locking loops on the kernel's block-on-mutex call. A thread woken from
//! a mutex wait gets [`MUTEX_RETRY`] and tries again; `0` means acquired.

use lumen_execution::{MutexId, ThreadId, MUTEX_RETRY};
use spin::Mutex;

use crate::{SyscallPort, UserError, UserResult, STATS};

/// Mutex flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Relocking by the holder is an error
    NonRecursive,
    /// The holder may lock again; each lock needs an unlock
    Recursive,
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: u32,
}

/// A user mutex
#[derive(Debug)]
pub struct UserMutex {
    id: MutexId,
    kind: MutexKind,
    state: Mutex<Ownership>,
}

impl UserMutex {
    /// Create a mutex backed by a fresh kernel mutex
    pub fn new<P: SyscallPort + ?Sized>(port: &P, kind: MutexKind) -> UserResult<Self> {
        let id = port.mutex_create()?;
        Ok(Self {
            id,
            kind,
            state: Mutex::new(Ownership::default()),
        })
    }

    /// Kernel mutex behind this one
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Flavour
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Current holder
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Lock depth of the holder (0 when free)
    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    /// Acquire, blocking until the mutex is free
    pub fn lock<P: SyscallPort + ?Sized>(&self, port: &P) -> UserResult<()> {
        let me = port.getthrid()?;
        {
            let mut state = self.state.lock();
            if state.owner == Some(me) {
                return match self.kind {
                    MutexKind::Recursive => {
                        state.depth += 1;
                        Ok(())
                    }
                    MutexKind::NonRecursive => Err(UserError::Deadlock),
                };
            }
        }

        loop {
            match port.mutex_block(self.id)? {
                0 => break,
                MUTEX_RETRY => STATS.mutex_retried(),
                other => return Err(UserError::Unknown(other)),
            }
        }

        let mut state = self.state.lock();
        state.owner = Some(me);
        state.depth = 1;
        Ok(())
    }

    /// Release one level of the lock
    pub fn unlock<P: SyscallPort + ?Sized>(&self, port: &P) -> UserResult<()> {
        let me = port.getthrid()?;
        {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(UserError::NotOwner);
            }
            state.depth -= 1;
            if state.depth > 0 {
                return Ok(());
            }
            state.owner = None;
        }
        port.mutex_unlock(self.id)
    }

    /// Return the kernel mutex
    pub fn destroy<P: SyscallPort + ?Sized>(self, port: &P) -> UserResult<()> {
        port.mutex_destroy(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use lumen_execution::{ExecError, Sysno};

    #[test]
    fn test_non_recursive() {
        let port = KernelPort::new();
        let m = UserMutex::new(&port, MutexKind::NonRecursive).unwrap();
        let me = port.getthrid().unwrap();

        m.lock(&port).unwrap();
        assert_eq!(m.owner(), Some(me));
        port.with(|k| assert!(k.mutex(m.id()).unwrap().is_locked()));
        assert_eq!(m.lock(&port), Err(UserError::Deadlock));

        m.unlock(&port).unwrap();
        assert_eq!(m.owner(), None);
        port.with(|k| assert!(!k.mutex(m.id()).unwrap().is_locked()));
        assert_eq!(m.unlock(&port), Err(UserError::NotOwner));
    }

    #[test]
    fn test_recursive_depth() {
        let port = KernelPort::new();
        let m = UserMutex::new(&port, MutexKind::Recursive).unwrap();
        for depth in 1..=5 {
            m.lock(&port).unwrap();
            assert_eq!(m.depth(), depth);
        }
        for _ in 0..4 {
            m.unlock(&port).unwrap();
        }
        port.with(|k| assert!(k.mutex(m.id()).unwrap().is_locked()));
        m.unlock(&port).unwrap();
        assert_eq!(m.depth(), 0);
        port.with(|k| assert!(!k.mutex(m.id()).unwrap().is_locked()));

        let id = m.id();
        m.destroy(&port).unwrap();
        port.with(|k| assert_eq!(k.mutex(id).err(), Some(ExecError::BadMutex)));
    }

    #[test]
    fn test_retries_until_acquired() {
        let port = ScriptedPort::new(ThreadId::from_raw(3));
        port.reply(&[7]);
        let m = UserMutex::new(&port, MutexKind::NonRecursive).unwrap();

        port.reply(&[MUTEX_RETRY, MUTEX_RETRY, 0]);
        m.lock(&port).unwrap();
        assert_eq!(port.count(Sysno::MutexBlock), 3);
        assert_eq!(m.owner(), Some(ThreadId::from_raw(3)));
    }

    #[test]
    fn test_other_thread_cannot_unlock() {
        let port = ScriptedPort::new(ThreadId::from_raw(3));
        port.reply(&[7]);
        let m = UserMutex::new(&port, MutexKind::Recursive).unwrap();
        m.lock(&port).unwrap();

        *port.tid.lock() = ThreadId::from_raw(4);
        assert_eq!(m.unlock(&port), Err(UserError::NotOwner));
        assert_eq!(port.count(Sysno::MutexUnlock), 0);
        assert_eq!(m.owner(), Some(ThreadId::from_raw(3)));
    }

    #[test]
    fn test_kernel_error_propagates() {
        let port = ScriptedPort::new(ThreadId::from_raw(3));
        port.reply(&[7, ExecError::BadMutex.errno()]);
        let m = UserMutex::new(&port, MutexKind::NonRecursive).unwrap();
        assert_eq!(m.lock(&port), Err(UserError::Kernel(ExecError::BadMutex)));
        assert_eq!(m.owner(), None);
    }
}
