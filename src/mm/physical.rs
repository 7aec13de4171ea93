//! Physical Memory Window
//!
//! The kernel reaches RAM through one linear window: on hardware this is the
//! higher-half direct map set up at boot, in host tests an owned buffer.
//! Page-table walks and quickmapped frames both go through it.
//!
//! # Safety
//! The window is the only place raw frame pointers are produced. Callers
//! must hold whatever lock owns the frame (address-space lock for page
//! tables, a quickmap slot for data frames) while the reference lives.

use core::ptr::NonNull;

use super::address::{PhysAddr, PAGE_SIZE};
use super::paging::PageTable;

/// A linear view onto physical memory `[base, base + len)`.
#[derive(Debug)]
pub struct PhysicalMemory {
    base: PhysAddr,
    window: NonNull<u8>,
    len: usize,
}

// SAFETY: The window is plain memory; every access is serialized by the
// owner of the frame being touched (see module docs).
unsafe impl Send for PhysicalMemory {}
// SAFETY: See above.
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// Create a window covering `len` bytes of RAM starting at `base`.
    ///
    /// # Safety
    /// `window` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the returned value, page aligned, and not aliased by any
    /// other Rust reference.
    pub unsafe fn new(base: PhysAddr, window: NonNull<u8>, len: usize) -> Self {
        debug_assert!(base.is_aligned());
        debug_assert!(window.as_ptr() as usize % PAGE_SIZE == 0);
        Self { base, window, len }
    }

    /// Window for the QEMU virt machine via the higher-half direct map.
    ///
    /// # Safety
    /// The direct map must cover `len` bytes starting at `PHYS_MEM_BASE`.
    #[cfg(target_os = "none")]
    pub unsafe fn direct_map(len: usize) -> Self {
        use super::address::{KERNEL_VIRT_BASE, PHYS_MEM_BASE};
        let ptr = (KERNEL_VIRT_BASE + PHYS_MEM_BASE) as *mut u8;
        // SAFETY: The caller guarantees the direct map is live.
        unsafe { Self::new(PhysAddr::new(PHYS_MEM_BASE), NonNull::new_unchecked(ptr), len) }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the whole frame at `addr` lies inside the window.
    #[inline]
    pub fn contains_frame(&self, addr: PhysAddr) -> bool {
        addr.is_aligned()
            && addr.as_usize() >= self.base.as_usize()
            && addr.as_usize() + PAGE_SIZE <= self.base.as_usize() + self.len
    }

    /// Raw pointer to the first byte of the frame at `addr`.
    ///
    /// # Panics
    /// Panics if the frame is outside the window.
    pub fn frame_ptr(&self, addr: PhysAddr) -> *mut u8 {
        assert!(self.contains_frame(addr), "frame {} outside physical window", addr);
        let offset = addr.as_usize() - self.base.as_usize();
        // SAFETY: offset + PAGE_SIZE <= len, checked above.
        unsafe { self.window.as_ptr().add(offset) }
    }

    /// Borrow a frame's bytes.
    ///
    /// # Safety
    /// The caller must own the frame exclusively for `'a`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut<'a>(&self, addr: PhysAddr) -> &'a mut [u8; PAGE_SIZE] {
        // SAFETY: frame_ptr is in bounds and page aligned; exclusivity is the caller's.
        unsafe { &mut *(self.frame_ptr(addr) as *mut [u8; PAGE_SIZE]) }
    }

    /// Copy the frame at `addr` into `buf`.
    ///
    /// # Panics
    /// Panics if the frame is outside the window.
    pub fn read_frame(&self, addr: PhysAddr, buf: &mut [u8; PAGE_SIZE]) {
        let src = self.frame_ptr(addr);
        // SAFETY: `src` is valid for PAGE_SIZE bytes and never overlaps a
        // Rust-owned buffer.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), PAGE_SIZE) };
    }

    /// Borrow the page table stored in the frame at `addr`.
    ///
    /// # Safety
    /// The frame must hold a page table and the caller must hold the lock of
    /// the page directory owning it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn table_mut<'a>(&self, addr: PhysAddr) -> &'a mut PageTable {
        // SAFETY: PageTable is repr(C, align(4096)) and exactly one frame in size.
        unsafe { &mut *(self.frame_ptr(addr) as *mut PageTable) }
    }

    /// Fill a frame with zeros.
    ///
    /// # Safety
    /// The caller must own the frame exclusively.
    pub unsafe fn zero_frame(&self, addr: PhysAddr) {
        // SAFETY: in bounds per frame_ptr; exclusivity is the caller's.
        unsafe { core::ptr::write_bytes(self.frame_ptr(addr), 0, PAGE_SIZE) };
    }
}
