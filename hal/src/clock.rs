//! # Clock
//!
//! Monotonic time as seen by the scheduler.

/// Monotonic tick source
pub trait Clock {
    /// Current tick count
    fn now(&self) -> u64;

    /// Ticks per millisecond, from hardware calibration
    fn ticks_per_ms(&self) -> u64;

    /// Convert a duration in milliseconds to ticks
    fn ms_to_ticks(&self, ms: u64) -> u64 {
        ms.saturating_mul(self.ticks_per_ms())
    }

    /// Absolute deadline `ms` milliseconds from now
    fn deadline_after_ms(&self, ms: u64) -> u64 {
        self.now().saturating_add(self.ms_to_ticks(ms))
    }
}
