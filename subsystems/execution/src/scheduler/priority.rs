//! # Priority Management
//!
//! Fixed thread priorities used by the real-time class. A larger value
//! is more urgent.

use core::fmt;

/// Fixed thread priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u32);

impl Priority {
    /// Lowest priority
    pub const MIN: Self = Self(0);

    /// Highest priority
    pub const MAX: Self = Self(u32::MAX);

    /// Priority given to new threads
    pub const DEFAULT: Self = Self(10);

    /// Create a new priority
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
