//! # Thread States
//!
//! Thread state machine and blocking reasons.

use crate::{MutexId, ThreadId};

/// Thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadStatus {
    /// Slot is on the free stack
    Free,
    /// Ready to run
    #[default]
    Runnable,
    /// Currently running
    Running,
    /// Blocked; see [`WaitReason`]
    NotRunnable,
}

impl ThreadStatus {
    /// Check if thread can be scheduled
    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadStatus::Runnable | ThreadStatus::Running)
    }

    /// Check if thread is blocked
    pub fn is_blocked(self) -> bool {
        self == ThreadStatus::NotRunnable
    }

    /// Valid transitions from this state
    pub fn valid_transitions(self) -> &'static [ThreadStatus] {
        match self {
            ThreadStatus::Free => &[ThreadStatus::Runnable],
            ThreadStatus::Runnable => &[
                ThreadStatus::Running,
                ThreadStatus::NotRunnable,
                ThreadStatus::Free,
            ],
            ThreadStatus::Running => &[
                ThreadStatus::Runnable,
                ThreadStatus::NotRunnable,
                ThreadStatus::Free,
            ],
            ThreadStatus::NotRunnable => &[ThreadStatus::Runnable, ThreadStatus::Free],
        }
    }
}

/// Why a thread is not runnable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitReason {
    /// Not waiting
    #[default]
    NotWaiting,
    /// Waiting for a thread to exit
    Join(ThreadId),
    /// Waiting for a mutex to be released
    Mutex(MutexId),
    /// Sleeping until an absolute tick count
    Timer {
        /// Wake-up time in ticks
        wake_at: u64,
    },
    /// Waiting for an IPC operation of its environment
    Ipc,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(ThreadStatus::Running.is_runnable());
        assert!(ThreadStatus::NotRunnable.is_blocked());
        assert!(!ThreadStatus::Free
            .valid_transitions()
            .contains(&ThreadStatus::Running));
        assert!(ThreadStatus::NotRunnable
            .valid_transitions()
            .contains(&ThreadStatus::Runnable));
    }
}
