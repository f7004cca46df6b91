//! # CPU Context
//!
//! Scheduler-owned state of the single logical CPU, and the outcome of a
//! scheduling decision.

use crate::{EnvId, ThreadId};

/// Context switch reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Voluntary yield
    Yield,
    /// Timer preemption
    Preemption,
    /// Thread blocked
    Blocked,
    /// Thread or environment exited
    Exit,
}

/// What the CPU does after a kernel entry point returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Restore this thread's trap frame and return to user mode
    Resume(ThreadId),
    /// Nothing is runnable: idle until the next timer interrupt
    Halt,
    /// No environment exists: enter the kernel monitor
    Monitor,
}

impl Dispatch {
    /// The resumed thread, if any
    pub fn thread(self) -> Option<ThreadId> {
        match self {
            Dispatch::Resume(id) => Some(id),
            _ => None,
        }
    }
}

/// Per-CPU scheduling state
#[derive(Debug, Clone, Copy, Default)]
pub struct Cpu {
    /// Environment whose address space is active
    pub(crate) current_env: Option<EnvId>,
    /// Thread whose trap frame is live
    pub(crate) current_thread: Option<ThreadId>,
    /// Slot of the environment that ran last, where round-robin resumes
    pub(crate) last_env_slot: Option<usize>,
}

impl Cpu {
    /// Create an idle CPU
    pub const fn new() -> Self {
        Self {
            current_env: None,
            current_thread: None,
            last_env_slot: None,
        }
    }

    /// Current environment
    pub fn current_env(&self) -> Option<EnvId> {
        self.current_env
    }

    /// Current thread
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    /// Slot of the last environment to run
    pub fn last_env_slot(&self) -> Option<usize> {
        self.last_env_slot
    }
}
