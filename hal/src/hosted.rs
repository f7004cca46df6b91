//! # Hosted Simulation
//!
//! In-memory address spaces and a settable clock. These stand in for the
//! real MMU and cycle counter when the execution core runs inside a test
//! harness or a tool on a host operating system.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    clock::Clock,
    mmu::{AddressSpaceService, Protection, SpaceId},
    HalError, HalResult, VirtAddr, PAGE_SIZE,
};

/// Default exclusive upper bound of user addresses
pub const DEFAULT_MAX_USER: u64 = 0x80_0000_0000;

const PAGE: u64 = PAGE_SIZE as u64;

type Frame = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
struct SimPage {
    frame: Frame,
    prot: Protection,
}

#[derive(Debug, Default)]
struct SimSpace {
    pages: BTreeMap<u64, SimPage>,
}

/// Address spaces backed by heap pages
#[derive(Debug)]
pub struct SimAddressSpaces {
    spaces: Vec<Option<SimSpace>>,
    current: SpaceId,
    max_user: VirtAddr,
    fail_maps: u32,
}

impl Default for SimAddressSpaces {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAddressSpaces {
    /// Create the simulation with only the kernel space present
    pub fn new() -> Self {
        Self {
            spaces: vec![Some(SimSpace::default())],
            current: SpaceId::KERNEL,
            max_user: VirtAddr::new(DEFAULT_MAX_USER),
            fail_maps: 0,
        }
    }

    /// Override the user address limit
    pub fn with_max_user(mut self, max: VirtAddr) -> Self {
        self.max_user = max;
        self
    }

    /// Make the next `n` calls to `map_region` fail with `OutOfMemory`
    pub fn fail_next_maps(&mut self, n: u32) {
        self.fail_maps = n;
    }

    /// Whether the page containing `va` is mapped
    pub fn is_mapped(&self, space: SpaceId, va: VirtAddr) -> bool {
        self.page(space, va).is_some()
    }

    /// Protection of the page containing `va`
    pub fn protection(&self, space: SpaceId, va: VirtAddr) -> Option<Protection> {
        self.page(space, va).map(|p| p.prot)
    }

    /// Number of pages mapped in `space`
    pub fn mapped_pages(&self, space: SpaceId) -> usize {
        self.space(space).map_or(0, |s| s.pages.len())
    }

    /// Number of live spaces, the kernel space excluded
    pub fn live_spaces(&self) -> usize {
        self.spaces.iter().skip(1).filter(|s| s.is_some()).count()
    }

    fn space(&self, id: SpaceId) -> Option<&SimSpace> {
        self.spaces.get(id.as_u32() as usize).and_then(Option::as_ref)
    }

    fn space_mut(&mut self, id: SpaceId) -> HalResult<&mut SimSpace> {
        self.spaces
            .get_mut(id.as_u32() as usize)
            .and_then(Option::as_mut)
            .ok_or(HalError::NoSuchSpace)
    }

    fn page(&self, space: SpaceId, va: VirtAddr) -> Option<&SimPage> {
        let key = va.align_down(PAGE).as_u64();
        self.space(space).and_then(|s| s.pages.get(&key))
    }

    fn pages_of(va: VirtAddr, size: usize) -> impl Iterator<Item = u64> {
        let start = va.align_down(PAGE).as_u64();
        let end = va.add(size as u64).align_up(PAGE).as_u64();
        (start..end).step_by(PAGE_SIZE)
    }

    /// Walk `va..va+len` page by page, handing each chunk to `f`
    fn for_each_chunk(
        &self,
        space: SpaceId,
        va: VirtAddr,
        len: usize,
        mut f: impl FnMut(&SimPage, usize, usize, usize),
    ) -> HalResult<()> {
        let space = self.space(space).ok_or(HalError::NoSuchSpace)?;
        let mut done = 0usize;
        while done < len {
            let addr = va.as_u64() + done as u64;
            let key = addr & !(PAGE - 1);
            let offset = (addr - key) as usize;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            let page = space.pages.get(&key).ok_or(HalError::InvalidAddress)?;
            f(page, offset, done, chunk);
            done += chunk;
        }
        Ok(())
    }
}

impl AddressSpaceService for SimAddressSpaces {
    fn create(&mut self) -> HalResult<SpaceId> {
        let slot = match self.spaces.iter().skip(1).position(Option::is_none) {
            Some(i) => i + 1,
            None => {
                self.spaces.push(None);
                self.spaces.len() - 1
            }
        };
        self.spaces[slot] = Some(SimSpace::default());
        log::trace!("sim: created space {}", slot);
        let raw = u32::try_from(slot).map_err(|_| HalError::OutOfMemory)?;
        Ok(SpaceId::new(raw))
    }

    fn release(&mut self, space: SpaceId) {
        if space == SpaceId::KERNEL {
            return;
        }
        if let Some(slot) = self.spaces.get_mut(space.as_u32() as usize) {
            *slot = None;
        }
        if self.current == space {
            self.current = SpaceId::KERNEL;
        }
    }

    fn current(&self) -> SpaceId {
        self.current
    }

    fn switch(&mut self, to: SpaceId) -> SpaceId {
        core::mem::replace(&mut self.current, to)
    }

    fn map_region(
        &mut self,
        dst: SpaceId,
        dst_va: VirtAddr,
        src: Option<(SpaceId, VirtAddr)>,
        size: usize,
        prot: Protection,
    ) -> HalResult<()> {
        if self.fail_maps > 0 {
            self.fail_maps -= 1;
            log::debug!("sim: injected map failure at {}", dst_va);
            return Err(HalError::OutOfMemory);
        }
        if !dst_va.is_page_aligned() || dst_va.as_u64().saturating_add(size as u64) > self.max_user.as_u64() {
            return Err(HalError::InvalidAddress);
        }

        let frames: Vec<Frame> = match src {
            Some((src_space, src_va)) => {
                if !src_va.is_page_aligned() {
                    return Err(HalError::InvalidAddress);
                }
                let space = self.space(src_space).ok_or(HalError::NoSuchSpace)?;
                Self::pages_of(src_va, size)
                    .map(|key| {
                        space
                            .pages
                            .get(&key)
                            .map(|p| Arc::clone(&p.frame))
                            .ok_or(HalError::InvalidAddress)
                    })
                    .collect::<HalResult<_>>()?
            }
            None => Self::pages_of(dst_va, size)
                .map(|_| Arc::new(Mutex::new(vec![0u8; PAGE_SIZE])))
                .collect(),
        };

        let dst_space = self.space_mut(dst)?;
        for (key, frame) in Self::pages_of(dst_va, size).zip(frames) {
            dst_space.pages.insert(key, SimPage { frame, prot });
        }
        Ok(())
    }

    fn unmap_region(&mut self, space: SpaceId, va: VirtAddr, size: usize) {
        if let Ok(s) = self.space_mut(space) {
            for key in Self::pages_of(va, size) {
                s.pages.remove(&key);
            }
        }
    }

    fn check_access(&self, space: SpaceId, va: VirtAddr, size: usize, prot: Protection) -> HalResult<()> {
        let s = self.space(space).ok_or(HalError::NoSuchSpace)?;
        if va.as_u64().saturating_add(size as u64) > self.max_user.as_u64() {
            return Err(HalError::InvalidAddress);
        }
        for key in Self::pages_of(va, size) {
            let page = s.pages.get(&key).ok_or(HalError::InvalidAddress)?;
            if !page.prot.contains(prot) {
                return Err(HalError::PermissionDenied);
            }
        }
        Ok(())
    }

    fn write_bytes(&mut self, space: SpaceId, va: VirtAddr, bytes: &[u8]) -> HalResult<()> {
        self.for_each_chunk(space, va, bytes.len(), |page, offset, done, chunk| {
            page.frame.lock()[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
        })
    }

    fn read_bytes(&self, space: SpaceId, va: VirtAddr, buf: &mut [u8]) -> HalResult<()> {
        let len = buf.len();
        self.for_each_chunk(space, va, len, |page, offset, done, chunk| {
            buf[done..done + chunk].copy_from_slice(&page.frame.lock()[offset..offset + chunk]);
        })
    }

    fn max_user_address(&self) -> VirtAddr {
        self.max_user
    }
}

/// Manually driven clock
#[derive(Debug)]
pub struct SimClock {
    now: AtomicU64,
    ticks_per_ms: u64,
}

impl SimClock {
    /// Create a clock at tick zero
    pub const fn new(ticks_per_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            ticks_per_ms,
        }
    }

    /// Move time forward by `ticks`
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Move time forward by `ms` milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance(self.ms_to_ticks(ms));
    }

    /// Set the absolute tick count
    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::Relaxed);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Clock for SimClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn ticks_per_ms(&self) -> u64 {
        self.ticks_per_ms
    }
}
