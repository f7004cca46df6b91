//! # Address Space Service
//!
//! The execution core never touches page tables. It asks this service to
//! create and tear down address spaces, to back thread stacks, and to share
//! a region of one space into another during IPC.

use crate::{HalResult, VirtAddr};
use bitflags::bitflags;

bitflags! {
    /// Mapping protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Execute access
        const EXECUTE = 1 << 2;
        /// Accessible from user mode
        const USER = 1 << 3;
        /// Read + Write
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Write + Execute
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Protection {
    /// Flags for a user stack page
    pub const fn user_stack() -> Self {
        Self::RW.union(Self::USER)
    }

    /// Only the access bits (read/write/execute)
    pub const fn access(self) -> Self {
        self.intersection(Self::RWX)
    }
}

/// Opaque handle of an address space owned by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(u32);

impl SpaceId {
    /// The kernel address space, always present
    pub const KERNEL: Self = Self(0);

    /// Create a space handle from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Address space service contract
pub trait AddressSpaceService {
    /// Create a fresh, empty user address space
    fn create(&mut self) -> HalResult<SpaceId>;

    /// Release an address space and every mapping in it
    fn release(&mut self, space: SpaceId);

    /// The currently active address space
    fn current(&self) -> SpaceId;

    /// Activate `to`, returning the previously active space
    fn switch(&mut self, to: SpaceId) -> SpaceId;

    /// Map `size` bytes at `dst_va` in `dst`.
    ///
    /// With `src = None` the region is backed by fresh zeroed memory.
    /// With `src = Some((space, va))` the pages backing `va..va+size` in
    /// `space` become shared with the destination.
    fn map_region(
        &mut self,
        dst: SpaceId,
        dst_va: VirtAddr,
        src: Option<(SpaceId, VirtAddr)>,
        size: usize,
        prot: Protection,
    ) -> HalResult<()>;

    /// Unmap `size` bytes at `va` (missing pages are ignored)
    fn unmap_region(&mut self, space: SpaceId, va: VirtAddr, size: usize);

    /// Verify that `va..va+size` is mapped in `space` with at least `prot`
    fn check_access(&self, space: SpaceId, va: VirtAddr, size: usize, prot: Protection) -> HalResult<()>;

    /// Copy bytes into a mapped region, ignoring write protection
    fn write_bytes(&mut self, space: SpaceId, va: VirtAddr, bytes: &[u8]) -> HalResult<()>;

    /// Copy bytes out of a mapped region
    fn read_bytes(&self, space: SpaceId, va: VirtAddr, buf: &mut [u8]) -> HalResult<()>;

    /// Exclusive upper bound of user addresses
    fn max_user_address(&self) -> VirtAddr;
}
