//! Addresses and the virtual memory layout
//!
//! `PhysAddr` and `VirtAddr` are distinct newtypes, so a frame address can
//! never be handed to code expecting a mapping and vice versa.
//!
//! # Layout (48-bit VA, 4 KiB granule)
//! - `0x0000_0000_0001_0000 .. USER_RANGE_END`: user regions (TTBR0)
//! - `KERNEL_VIRT_BASE ..`: kernel half (TTBR1)
//!   - `KERNEL_REGION_BASE`: window for kernel-only regions
//!   - `QUICKMAP_BASE`: one page per CPU for temporary frame mappings

use core::fmt;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
pub const PAGE_SHIFT: usize = 12;

/// Descriptors in one translation table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Start of the TTBR1 half.
pub const KERNEL_VIRT_BASE: usize = 0xFFFF_0000_0000_0000;

/// Lowest mappable user address. The first 64 KiB stay unmapped so that
/// null-pointer dereferences always fault.
pub const USER_RANGE_BASE: usize = 0x0000_0000_0001_0000;

/// End (exclusive) of the user half.
pub const USER_RANGE_END: usize = 0x0000_FFFF_0000_0000;

/// Base of the window handed out by `allocate_kernel_region`.
pub const KERNEL_REGION_BASE: usize = KERNEL_VIRT_BASE + 0x0000_1000_0000_0000;

/// Size of the kernel region window (64 GiB).
pub const KERNEL_REGION_SIZE: usize = 0x0000_0010_0000_0000;

/// Base of the per-CPU quickmap slots. Slot `n` lives at `QUICKMAP_BASE + n * PAGE_SIZE`.
pub const QUICKMAP_BASE: usize = KERNEL_VIRT_BASE + 0x0000_2000_0000_0000;

/// Maximum number of CPUs the quickmap window has slots for.
pub const MAX_CPUS: usize = 64;

/// Where RAM starts on the QEMU `virt` board.
pub const PHYS_MEM_BASE: usize = 0x4000_0000;

/// Round `value` up to the next page boundary, `None` on overflow.
#[inline]
pub const fn page_round_up(value: usize) -> Option<usize> {
    match value.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Address of a byte of RAM.
///
/// Never dereferenced directly; frames are reached through the
/// [`PhysicalMemory`](super::physical::PhysicalMemory) window or a quickmap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Debug builds reject addresses wider than the 48-bit PA space.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        debug_assert!(addr >> 48 == 0);
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Start of the frame containing this address.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A virtual memory address.
///
/// ARM64 splits the 64-bit space in two halves: bits [63:48] all clear
/// select TTBR0 (user), all set select TTBR1 (kernel). Anything else is
/// non-canonical and always faults.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a virtual address. The value is kept as-is; use
    /// [`is_canonical`](Self::is_canonical) to check it.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Whether bits [63:48] are either all clear or all set.
    #[inline]
    pub const fn is_canonical(self) -> bool {
        let top = self.0 >> 48;
        top == 0 || top == 0xFFFF
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Start of the page containing this address.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Table index at L0, L1, L2 and L3, in that order.
    #[inline]
    pub const fn page_table_indices(self) -> (usize, usize, usize, usize) {
        const fn index(addr: usize, shift: usize) -> usize {
            (addr >> shift) & (ENTRIES_PER_TABLE - 1)
        }
        (index(self.0, 39), index(self.0, 30), index(self.0, 21), index(self.0, PAGE_SHIFT))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Wraps on overflow; callers range-check before and after.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// In the TTBR1 half.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VIRT_BASE
    }

    /// In the mappable user range, which excludes the null guard.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 >= USER_RANGE_BASE && self.0 < USER_RANGE_END
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A page-aligned, non-empty virtual range `[base, base + size)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualRange {
    base: VirtAddr,
    size: usize,
}

impl VirtualRange {
    /// Build a range; `None` if misaligned, empty or wrapping.
    pub const fn new(base: VirtAddr, size: usize) -> Option<Self> {
        if !base.is_aligned() || size == 0 || size & PAGE_MASK != 0 {
            return None;
        }
        if base.as_usize().checked_add(size).is_none() {
            return None;
        }
        Some(Self { base, size })
    }

    #[inline]
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// First address past the range.
    #[inline]
    pub const fn end(&self) -> VirtAddr {
        VirtAddr::new(self.base.as_usize() + self.size)
    }

    #[inline]
    pub const fn page_count(&self) -> usize {
        self.size >> PAGE_SHIFT
    }

    #[inline]
    pub const fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.base.as_usize() && addr.as_usize() < self.end().as_usize()
    }

    /// Whether `[addr, addr + len)` lies entirely inside this range.
    pub const fn contains_span(&self, addr: VirtAddr, len: usize) -> bool {
        match addr.as_usize().checked_add(len) {
            Some(end) => {
                addr.as_usize() >= self.base.as_usize() && end <= self.end().as_usize()
            }
            None => false,
        }
    }

    #[inline]
    pub const fn intersects(&self, other: &VirtualRange) -> bool {
        self.base.as_usize() < other.end().as_usize()
            && other.base.as_usize() < self.end().as_usize()
    }

    /// Whole range inside the user half.
    pub const fn is_user(&self) -> bool {
        self.base.as_usize() >= USER_RANGE_BASE && self.end().as_usize() <= USER_RANGE_END
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.base, self.end())
    }
}
