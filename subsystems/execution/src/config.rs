//! # Execution Core Configuration

use lumen_hal::VirtAddr;

use crate::scheduler::Priority;

/// What happens when a real-time job spends its budget before its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetPolicy {
    /// Keep the job runnable; its slack shrinks to zero
    #[default]
    Continue,
    /// Park the job until the deadline check demotes it
    Throttle,
}

/// Configuration for the execution core
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Fixed priority given to new threads
    pub default_priority: Priority,
    /// Top of the user stack area; thread `n` gets the `n`-th stack below it
    pub user_stack_top: VirtAddr,
    /// Size of each thread stack
    pub user_stack_size: usize,
    /// Top of the user exception stack area (one page per thread slot)
    pub user_exception_stack_top: VirtAddr,
    /// Budget exhaustion policy for real-time jobs
    pub budget_policy: BudgetPolicy,
    /// Drop into the monitor when no environment exists at all
    pub monitor_on_empty: bool,
}

impl ExecConfig {
    /// Default user stack top
    pub const USER_STACK_TOP: u64 = 0x7f_fe00_0000;
    /// Default per-thread stack size: 8 KiB
    pub const USER_STACK_SIZE: usize = 2 * lumen_hal::PAGE_SIZE;
    /// Default user exception stack top
    pub const USER_EXCEPTION_STACK_TOP: u64 = 0x7f_ff00_0000;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            default_priority: Priority::DEFAULT,
            user_stack_top: VirtAddr::new(Self::USER_STACK_TOP),
            user_stack_size: Self::USER_STACK_SIZE,
            user_exception_stack_top: VirtAddr::new(Self::USER_EXCEPTION_STACK_TOP),
            budget_policy: BudgetPolicy::Continue,
            monitor_on_empty: true,
        }
    }

    /// Configuration that parks real-time jobs once their budget is spent
    pub fn throttling() -> Self {
        Self {
            budget_policy: BudgetPolicy::Throttle,
            ..Self::new()
        }
    }

    /// Stack region `(base, top)` of the thread in local slot `local`
    pub fn stack_for(&self, local: usize) -> (VirtAddr, VirtAddr) {
        let size = self.user_stack_size as u64;
        let top = self.user_stack_top.sub(local as u64 * size);
        (top.sub(size), top)
    }

    /// Top of the exception stack page of local slot `local`
    pub fn exception_stack_for(&self, local: usize) -> VirtAddr {
        self.user_exception_stack_top
            .sub(local as u64 * lumen_hal::PAGE_SIZE as u64)
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let config = ExecConfig::new();
        let (base0, top0) = config.stack_for(0);
        let (base1, top1) = config.stack_for(1);
        assert_eq!(top0.as_u64(), ExecConfig::USER_STACK_TOP);
        assert_eq!(top1, base0);
        assert_eq!(top1.as_u64() - base1.as_u64(), config.user_stack_size as u64);
        assert_eq!(
            config.exception_stack_for(2).as_u64(),
            ExecConfig::USER_EXCEPTION_STACK_TOP - 2 * 4096
        );
    }

    #[test]
    fn test_presets() {
        assert_eq!(ExecConfig::default().budget_policy, BudgetPolicy::Continue);
        assert_eq!(ExecConfig::throttling().budget_policy, BudgetPolicy::Throttle);
    }
}
