//! # Lumen Execution Core
//!
//! The execution core decides, at every reschedule point, which environment
//! and which thread inside it runs next. It manages:
//! - Environments (protection domains) and their real-time parameters
//! - Threads and the per-environment thread ring
//! - Kernel mutexes requested by user-space thread libraries
//! - Timed IPC with optional region transfer
//! - The dual-class scheduler (round-robin and deadline-driven)
//!
//! ## Key Principle
//!
//! Blocking never suspends kernel control flow. A blocked thread is marked
//! not runnable with a reason, and the scheduler re-polls that reason on
//! each pass. Every entry point returns a [`Dispatch`] telling the host
//! what the CPU resumes next.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod environment;
pub mod handle;
pub mod ipc;
pub mod kernel;
pub mod mutex;
pub mod scheduler;
pub mod syscall;
pub mod thread;

use core::fmt;

use lumen_hal::HalError;
use static_assertions::const_assert;

pub use config::{BudgetPolicy, ExecConfig};
pub use context::{Dispatch, SwitchReason};
pub use environment::{Env, EnvClass, EnvSpec, EnvStatus, EnvType, RealTimeParams};
pub use handle::{Handle, HandleTable};
pub use kernel::Kernel;
pub use scheduler::Priority;
pub use syscall::{Syscall, SyscallArgs, Sysno};
pub use thread::{registry::MUTEX_RETRY, Thread, ThreadStatus, WaitReason};

// =============================================================================
// Identifier layout
// =============================================================================

/// log2 of the environment table size
pub const LOG2NENV: u32 = 10;
/// Environment table size
pub const NENV: usize = 1 << LOG2NENV;
/// First bit of the environment generation
pub const ENV_GEN_SHIFT: u32 = 12;

/// log2 of the thread table size
pub const LOG2NTHR: u32 = 12;
/// Thread table size
pub const NTHR: usize = 1 << LOG2NTHR;
/// log2 of the per-environment thread slot space
pub const LOG2NTHR_PER_ENV: u32 = 10;
/// Threads an environment may own at once
pub const NTHR_PER_ENV: usize = 1 << LOG2NTHR_PER_ENV;
/// First bit of the thread generation
pub const THR_GEN_SHIFT: u32 = 23;

/// log2 of the mutex table size
pub const LOG2NMUTEX: u32 = 10;
/// Mutex table size
pub const NMUTEX: usize = 1 << LOG2NMUTEX;
/// First bit of the mutex generation
pub const MUTEX_GEN_SHIFT: u32 = 12;

const_assert!(ENV_GEN_SHIFT >= LOG2NENV);
const_assert!(MUTEX_GEN_SHIFT >= LOG2NMUTEX);
const_assert!(THR_GEN_SHIFT > LOG2NTHR + LOG2NTHR_PER_ENV);
const_assert!(THR_GEN_SHIFT < 31);

const THR_LOCAL_MASK: i64 = (NTHR_PER_ENV as i64) - 1;
const THR_GEN_MASK: i32 = !((1 << (LOG2NTHR + LOG2NTHR_PER_ENV)) - 1);

/// Environment identifier: `generation | slot`
///
/// The value 0 is never issued and means "the caller's own environment".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(i32);

impl EnvId {
    /// Shorthand for the calling environment
    pub const SELF: Self = Self(0);

    /// Create an id from its raw value
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw id value
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Whether this is the "caller's own" shorthand
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    /// Table slot encoded in the id
    pub const fn slot(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Next id for `slot`, advancing the generation of its previous id
    pub(crate) fn next(prev: Option<Self>, slot: usize) -> Self {
        let prev = prev.map_or(0, |p| p.0);
        let mut generation = prev.wrapping_add(1 << ENV_GEN_SHIFT) & !((NENV as i32) - 1);
        if generation <= 0 {
            generation = 1 << ENV_GEN_SHIFT;
        }
        Self(generation | slot as i32)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

/// Thread identifier
///
/// Low 32 bits: `generation | local << LOG2NTHR | slot`.
/// High 32 bits: the owning environment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(i64);

impl ThreadId {
    /// Shorthand for the calling thread
    pub const SELF: Self = Self(0);

    /// Create an id from its raw value
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Get the raw id value
    pub const fn as_raw(self) -> i64 {
        self.0
    }

    /// Whether this is the "caller's own" shorthand
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    /// Global table slot
    pub const fn slot(self) -> usize {
        (self.0 as usize) & (NTHR - 1)
    }

    /// Slot inside the owning environment (selects the stack)
    pub const fn local(self) -> usize {
        ((self.0 >> LOG2NTHR) & THR_LOCAL_MASK) as usize
    }

    /// Owning environment
    pub const fn env(self) -> EnvId {
        EnvId((self.0 >> 32) as i32)
    }

    pub(crate) fn next(prev: Option<Self>, slot: usize, local: usize, env: EnvId) -> Self {
        let prev_low = prev.map_or(0, |p| p.0 as i32);
        let mut generation = prev_low.wrapping_add(1 << THR_GEN_SHIFT) & THR_GEN_MASK;
        if generation <= 0 {
            generation = 1 << THR_GEN_SHIFT;
        }
        let low = generation | ((local as i32) << LOG2NTHR) | slot as i32;
        Self((i64::from(env.as_raw()) << 32) | i64::from(low as u32))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:016x}]", self.0)
    }
}

/// Kernel mutex identifier: `generation | slot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MutexId(i32);

impl MutexId {
    /// Create an id from its raw value
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw id value
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Table slot encoded in the id
    pub const fn slot(self) -> usize {
        (self.0 as usize) & (NMUTEX - 1)
    }

    pub(crate) fn next(prev: Option<Self>, slot: usize) -> Self {
        let prev = prev.map_or(0, |p| p.0);
        let mut generation = prev.wrapping_add(1 << MUTEX_GEN_SHIFT) & !((NMUTEX as i32) - 1);
        if generation <= 0 {
            generation = 1 << MUTEX_GEN_SHIFT;
        }
        Self(generation | slot as i32)
    }
}

impl Handle for EnvId {
    fn slot(self) -> usize {
        EnvId::slot(self)
    }
}

impl Handle for ThreadId {
    fn slot(self) -> usize {
        ThreadId::slot(self)
    }
}

impl Handle for MutexId {
    fn slot(self) -> usize {
        MutexId::slot(self)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Stale or out-of-range environment id
    BadEnv,
    /// Stale or out-of-range thread id
    BadThr,
    /// Stale or out-of-range mutex id
    BadMutex,
    /// Environment table exhausted
    NoFreeEnv,
    /// Thread table or per-environment slot space exhausted
    NoFreeThread,
    /// Mutex table exhausted
    NoFreeMutex,
    /// Region mapping failed
    NoMemory,
    /// Mutex held by another thread
    MutexLocked,
    /// Destination is not receiving
    IpcNotReceiver,
    /// Sending thread vanished
    IpcBadSender,
    /// Receiving thread vanished
    IpcBadReceiver,
    /// IPC deadline elapsed
    Timeout,
    /// Thread not reachable from its environment's ring
    ThreadNotExists,
    /// Malformed argument
    InvalidArgument,
}

impl ExecError {
    const TABLE: [(ExecError, i64); 14] = [
        (ExecError::BadEnv, 2),
        (ExecError::InvalidArgument, 3),
        (ExecError::NoMemory, 4),
        (ExecError::NoFreeEnv, 5),
        (ExecError::IpcNotReceiver, 7),
        (ExecError::BadThr, 17),
        (ExecError::NoFreeThread, 18),
        (ExecError::ThreadNotExists, 19),
        (ExecError::BadMutex, 20),
        (ExecError::NoFreeMutex, 21),
        (ExecError::MutexLocked, 22),
        (ExecError::IpcBadSender, 23),
        (ExecError::IpcBadReceiver, 24),
        (ExecError::Timeout, 25),
    ];

    /// Negative code returned on the syscall boundary
    pub fn errno(self) -> i64 {
        Self::TABLE
            .iter()
            .find(|(e, _)| *e == self)
            .map_or(-1, |(_, code)| -code)
    }

    /// Decode a negative syscall return value
    pub fn from_errno(code: i64) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, c)| -c == code)
            .map(|(e, _)| *e)
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ExecError::BadEnv => "bad environment",
            ExecError::BadThr => "bad thread",
            ExecError::BadMutex => "bad mutex",
            ExecError::NoFreeEnv => "no free environment",
            ExecError::NoFreeThread => "no free thread",
            ExecError::NoFreeMutex => "no free mutex",
            ExecError::NoMemory => "out of memory",
            ExecError::MutexLocked => "mutex is locked",
            ExecError::IpcNotReceiver => "destination is not receiving",
            ExecError::IpcBadSender => "sending thread vanished",
            ExecError::IpcBadReceiver => "receiving thread vanished",
            ExecError::Timeout => "timed out",
            ExecError::ThreadNotExists => "thread not in its environment",
            ExecError::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

impl From<HalError> for ExecError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => ExecError::NoMemory,
            HalError::NoSuchSpace => ExecError::BadEnv,
            _ => ExecError::InvalidArgument,
        }
    }
}

/// Convert a result into the signed value written back to user space
pub fn to_syscall_return(result: ExecResult<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.errno(),
    }
}
