//! # Lumen Userspace Layer
//!
//! What an environment links against to talk to the execution core:
//! - Typed syscall wrappers over a [`SyscallPort`]
//! - Thread create / join / cancel / exit
//! - User mutexes (recursive and non-recursive) over kernel mutexes
//! - The deadline-exceeded handler registry
//!
//! Every call goes through a [`SyscallPort`], so the layer runs the same
//! on top of the real trap instruction or on a kernel driven by tests.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod deadline;
pub mod mutex;
pub mod sys;
pub mod thread;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use lumen_execution::ExecError;

// Re-exports
pub use deadline::{DeadlineHandler, DeadlineHandlers, MAX_DEADLINE_HANDLERS};
pub use mutex::{MutexKind, UserMutex};
pub use sys::SyscallPort;
pub use thread::{thread_cancel, thread_create, thread_exit, thread_join};

/// Userspace result type
pub type UserResult<T> = Result<T, UserError>;

/// Userspace errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    /// The kernel refused the call
    Kernel(ExecError),
    /// Negative return value with no known meaning
    Unknown(i64),
    /// Unlock by a thread that does not hold the mutex
    NotOwner,
    /// Non-recursive mutex locked again by its holder
    Deadlock,
    /// Deadline handler registry is full
    HandlersFull,
}

impl From<ExecError> for UserError {
    fn from(e: ExecError) -> Self {
        UserError::Kernel(e)
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserError::Kernel(e) => write!(f, "kernel: {}", e),
            UserError::Unknown(code) => write!(f, "unknown error {}", code),
            UserError::NotOwner => f.write_str("mutex not held by caller"),
            UserError::Deadlock => f.write_str("non-recursive mutex relocked by its holder"),
            UserError::HandlersFull => f.write_str("deadline handler registry full"),
        }
    }
}

/// Split a raw syscall return into a value or an error
pub fn check(ret: i64) -> UserResult<i64> {
    if ret >= 0 {
        Ok(ret)
    } else {
        Err(ExecError::from_errno(ret).map_or(UserError::Unknown(ret), UserError::Kernel))
    }
}

/// Statistics for the userspace layer
#[derive(Debug, Default)]
pub struct UserspaceStats {
    /// Number of syscalls made
    pub syscalls_made: AtomicU64,
    /// Number of threads spawned
    pub threads_spawned: AtomicU64,
    /// Mutex lock attempts that had to retry after a wakeup
    pub mutex_retries: AtomicU64,
    /// Deadline upcalls dispatched to handlers
    pub deadline_dispatches: AtomicU64,
}

impl UserspaceStats {
    /// Create new stats
    pub const fn new() -> Self {
        Self {
            syscalls_made: AtomicU64::new(0),
            threads_spawned: AtomicU64::new(0),
            mutex_retries: AtomicU64::new(0),
            deadline_dispatches: AtomicU64::new(0),
        }
    }

    /// Increment syscalls made
    pub fn syscall_made(&self) {
        self.syscalls_made.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment threads spawned
    pub fn thread_spawned(&self) {
        self.threads_spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment mutex retries
    pub fn mutex_retried(&self) {
        self.mutex_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment deadline dispatches
    pub fn deadline_dispatched(&self) {
        self.deadline_dispatches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Global userspace statistics
pub static STATS: UserspaceStats = UserspaceStats::new();
