//! # Lumen HAL - Hardware Abstraction Layer
//!
//! This crate defines the contracts the execution core consumes from the
//! rest of the kernel. Everything behind these traits (page tables, the
//! calibrated cycle counter, the trap entry path) is owned by the host.
//!
//! ## Collaborators
//!
//! - [`mmu::AddressSpaceService`]: create/release/switch address spaces,
//!   map and unmap regions, transfer regions between spaces
//! - [`clock::Clock`]: monotonic tick counter and its calibration
//! - [`cpu::TrapFrame`]: the saved register state of a user thread
//!
//! The [`hosted`] module provides in-memory implementations of the first two
//! so the scheduler can be driven from ordinary unit tests.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod clock;
pub mod cpu;
pub mod mmu;

// Hosted implementations (simulation for tests and tooling)
pub mod hosted;

use core::fmt;

pub use clock::Clock;
pub use cpu::{TrapFrame, UpcallFrame};
pub use mmu::{AddressSpaceService, Protection, SpaceId};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this architecture
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Address is invalid, unmapped or not aligned
    InvalidAddress,
    /// Memory allocation failed
    OutOfMemory,
    /// Permission denied
    PermissionDenied,
    /// The address space does not exist
    NoSuchSpace,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HalError::NotSupported => "operation not supported",
            HalError::InvalidParameter => "invalid parameter",
            HalError::InvalidAddress => "invalid address",
            HalError::OutOfMemory => "out of memory",
            HalError::PermissionDenied => "permission denied",
            HalError::NoSuchSpace => "no such address space",
        };
        f.write_str(msg)
    }
}

/// Size of the base page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Virtual address type (architecture-independent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The null address
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Check if the address is aligned to a page boundary
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE as u64)
    }

    /// Align the address up to the given alignment
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add a byte offset
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Subtract a byte offset
    #[inline]
    pub const fn sub(self, offset: u64) -> Self {
        Self(self.0 - offset)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
