//! # Scheduler Metrics
//!
//! Counters for scheduler activity, readable from the monitor.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Total context switches
    context_switches: AtomicU64,
    /// Total timer ticks
    ticks: AtomicU64,
    /// Total voluntary yields
    voluntary_yields: AtomicU64,
    /// Total preemptions
    preemptions: AtomicU64,
    /// Passes that found nothing runnable
    halts: AtomicU64,
    /// Real-time environments demoted for missing their deadline
    deadline_overruns: AtomicU64,
    /// Deadline upcalls pushed onto a user exception stack
    upcalls: AtomicU64,
    /// Completed IPC transfers
    ipc_deliveries: AtomicU64,
    /// IPC operations that expired
    ipc_timeouts: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            voluntary_yields: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            halts: AtomicU64::new(0),
            deadline_overruns: AtomicU64::new(0),
            upcalls: AtomicU64::new(0),
            ipc_deliveries: AtomicU64::new(0),
            ipc_timeouts: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timer tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a voluntary yield
    pub fn record_yield(&self) {
        self.voluntary_yields.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preemption
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a halt
    pub fn record_halt(&self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deadline overrun
    pub fn record_deadline_overrun(&self) {
        self.deadline_overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upcall delivery
    pub fn record_upcall(&self) {
        self.upcalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an IPC delivery
    pub fn record_ipc_delivery(&self) {
        self.ipc_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an IPC timeout
    pub fn record_ipc_timeout(&self) {
        self.ipc_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total context switches
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Get total ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Get voluntary yields
    pub fn voluntary_yields(&self) -> u64 {
        self.voluntary_yields.load(Ordering::Relaxed)
    }

    /// Get preemptions
    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    /// Get halts
    pub fn halts(&self) -> u64 {
        self.halts.load(Ordering::Relaxed)
    }

    /// Get deadline overruns
    pub fn deadline_overruns(&self) -> u64 {
        self.deadline_overruns.load(Ordering::Relaxed)
    }

    /// Get upcall deliveries
    pub fn upcalls(&self) -> u64 {
        self.upcalls.load(Ordering::Relaxed)
    }

    /// Get IPC deliveries
    pub fn ipc_deliveries(&self) -> u64 {
        self.ipc_deliveries.load(Ordering::Relaxed)
    }

    /// Get IPC timeouts
    pub fn ipc_timeouts(&self) -> u64 {
        self.ipc_timeouts.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.context_switches.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.voluntary_yields.store(0, Ordering::Relaxed);
        self.preemptions.store(0, Ordering::Relaxed);
        self.halts.store(0, Ordering::Relaxed);
        self.deadline_overruns.store(0, Ordering::Relaxed);
        self.upcalls.store(0, Ordering::Relaxed);
        self.ipc_deliveries.store(0, Ordering::Relaxed);
        self.ipc_timeouts.store(0, Ordering::Relaxed);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
