//! # Thread Structure
//!
//! Core thread data structure.

use lumen_hal::{TrapFrame, VirtAddr};

use super::{ThreadStatus, WaitReason};
use crate::scheduler::Priority;
use crate::{EnvId, ThreadId};

/// Thread structure
#[derive(Debug, Clone)]
pub struct Thread {
    /// Unique identifier
    pub(crate) id: ThreadId,
    /// Current status
    pub(crate) status: ThreadStatus,
    /// Blocking reason while not runnable
    pub(crate) wait: WaitReason,
    /// Next thread of the owning environment's ring
    pub(crate) next: Option<ThreadId>,
    /// Saved registers
    pub(crate) frame: TrapFrame,
    /// Fixed priority (real-time class)
    pub(crate) priority: Priority,
    /// Number of times this thread has been switched to
    pub(crate) runs: u64,
    /// Lowest address of the private stack
    pub(crate) stack_base: VirtAddr,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, frame: TrapFrame, priority: Priority, stack_base: VirtAddr) -> Self {
        Self {
            id,
            status: ThreadStatus::Runnable,
            wait: WaitReason::NotWaiting,
            next: None,
            frame,
            priority,
            runs: 0,
            stack_base,
        }
    }

    /// Get thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Get owning environment
    pub fn env(&self) -> EnvId {
        self.id.env()
    }

    /// Slot inside the owning environment
    pub fn local_slot(&self) -> usize {
        self.id.local()
    }

    /// Get current status
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Get blocking reason
    pub fn wait_reason(&self) -> WaitReason {
        self.wait
    }

    /// Next thread in the ring
    pub fn next(&self) -> Option<ThreadId> {
        self.next
    }

    /// Saved registers
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    /// Get priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Times switched to
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Get stack base (lowest address)
    pub fn stack_base(&self) -> VirtAddr {
        self.stack_base
    }

    /// Move to `next`, checking the transition in debug builds
    pub(crate) fn set_status(&mut self, next: ThreadStatus) {
        debug_assert!(
            self.status == next || self.status.valid_transitions().contains(&next),
            "thread {}: invalid transition {:?} -> {:?}",
            self.id,
            self.status,
            next
        );
        self.status = next;
    }

    /// Block with `reason`
    pub(crate) fn block(&mut self, reason: WaitReason) {
        self.set_status(ThreadStatus::NotRunnable);
        self.wait = reason;
    }

    /// Make runnable again with `ret` staged as the syscall return value
    pub(crate) fn wake(&mut self, ret: i64) {
        self.set_status(ThreadStatus::Runnable);
        self.wait = WaitReason::NotWaiting;
        self.frame.set_return(ret);
    }
}
