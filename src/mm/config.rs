//! Boot-time memory configuration.

use alloc::vec;
use alloc::vec::Vec;

use super::address::{PhysAddr, PAGE_SHIFT, PHYS_MEM_BASE};

/// A usable range of physical RAM reported by firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub base: PhysAddr,
    pub size: usize,
}

impl PhysRange {
    pub const fn new(base: PhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    #[inline]
    pub const fn page_count(&self) -> usize {
        self.size >> PAGE_SHIFT
    }
}

/// How physical memory is carved into pools at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Usable RAM, page aligned.
    pub ranges: Vec<PhysRange>,
    /// Pages taken from the start of `ranges` for the supervisor pool
    /// (page tables, kernel regions, DMA buffers). The rest is the user pool.
    pub supervisor_pages: usize,
}

impl MemoryConfig {
    /// QEMU `virt` defaults: 64 MiB of RAM after the 2 MiB kernel image,
    /// a quarter of it reserved for the supervisor pool.
    pub fn qemu_virt() -> Self {
        /// We skip the first 2MB to avoid kernel code/data.
        const FRAME_START: usize = PHYS_MEM_BASE + 0x20_0000;
        const USABLE: usize = 64 * 1024 * 1024;
        Self {
            ranges: vec![PhysRange::new(PhysAddr::new(FRAME_START), USABLE)],
            supervisor_pages: (USABLE >> PAGE_SHIFT) / 4,
        }
    }

    /// One RAM bank of `pages` pages, the first `supervisor_pages` of which
    /// form the supervisor pool.
    pub fn single_range(base: PhysAddr, pages: usize, supervisor_pages: usize) -> Self {
        Self {
            ranges: vec![PhysRange::new(base, pages << PAGE_SHIFT)],
            supervisor_pages,
        }
    }

    pub fn total_pages(&self) -> usize {
        self.ranges.iter().map(PhysRange::page_count).sum()
    }
}
