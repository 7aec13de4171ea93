//! Physical Page Allocator
//!
//! Manages physical memory pages (frames) using bitmap regions.
//!
//! # Design
//! - Usable RAM is carved into a supervisor pool (page tables, kernel
//!   regions, DMA buffers) and a user pool at boot
//! - Each pool is a list of [`PhysicalRegion`]s, one bit per 4KB frame
//! - Frames are handed out as reference-counted [`PhysicalPage`]s; the frame
//!   goes back to its pool exactly when the last reference is dropped
//! - One zero-filled frame is reserved as the shared zero page and is never
//!   returned to a pool
//!
//! # Security Properties
//! - Double-free is detected and causes a panic
//! - The pools are protected by a spinlock

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{info, trace, warn};
use spin::Mutex;

use super::address::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use super::bitmap::Bitmap;
use super::config::MemoryConfig;
use super::error::VmError;
use super::physical::PhysicalMemory;

/// Whether a fresh frame must be cleared before it is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    No,
    Yes,
}

/// Which pool a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    User,
    Supervisor,
}

/// A contiguous run of physical frames tracked by one bitmap.
pub struct PhysicalRegion {
    base: PhysAddr,
    /// 1 = allocated, 0 = free.
    bitmap: Bitmap,
    used: usize,
    next_hint: usize,
}

impl PhysicalRegion {
    fn new(base: PhysAddr, pages: usize) -> Self {
        Self {
            base,
            bitmap: Bitmap::new(pages, false),
            used: 0,
            next_hint: 0,
        }
    }

    fn pages(&self) -> usize {
        self.bitmap.len()
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        addr.as_usize() >= self.base.as_usize()
            && addr.as_usize() < self.base.as_usize() + (self.pages() << PAGE_SHIFT)
    }

    fn frame_index(&self, addr: PhysAddr) -> usize {
        (addr.as_usize() - self.base.as_usize()) >> PAGE_SHIFT
    }

    fn take_page(&mut self) -> Option<PhysAddr> {
        if self.used == self.pages() {
            return None;
        }
        let index = self.bitmap.find_first_unset(self.next_hint)?;
        self.bitmap.set(index, true);
        self.used += 1;
        self.next_hint = index + 1;
        Some(self.base.add(index << PAGE_SHIFT))
    }

    fn take_contiguous(&mut self, count: usize) -> Option<PhysAddr> {
        if self.pages() - self.used < count {
            return None;
        }
        let start = self.bitmap.find_unset_run(count)?;
        self.bitmap.set_range(start, count, true);
        self.used += count;
        Some(self.base.add(start << PAGE_SHIFT))
    }

    fn return_page(&mut self, addr: PhysAddr) {
        if !addr.is_aligned() {
            panic!("Attempted to free unaligned address: {:?}", addr);
        }
        let index = self.frame_index(addr);
        if !self.bitmap.get(index) {
            panic!("Double free detected for frame: {:?}", addr);
        }
        self.bitmap.set(index, false);
        self.used -= 1;
        if index < self.next_hint {
            self.next_hint = index;
        }
    }

    fn is_allocated(&self, addr: PhysAddr) -> bool {
        self.bitmap.get(self.frame_index(addr))
    }
}

struct Pools {
    user: Vec<PhysicalRegion>,
    supervisor: Vec<PhysicalRegion>,
}

impl Pools {
    fn regions_mut(&mut self, kind: PoolKind) -> &mut Vec<PhysicalRegion> {
        match kind {
            PoolKind::User => &mut self.user,
            PoolKind::Supervisor => &mut self.supervisor,
        }
    }

    fn region_of(&mut self, kind: PoolKind, addr: PhysAddr) -> &mut PhysicalRegion {
        match self.regions_mut(kind).iter_mut().find(|r| r.contains(addr)) {
            Some(region) => region,
            None => panic!("Attempted to free frame outside managed range: {:?}", addr),
        }
    }
}

/// State shared between the allocator and every live frame.
struct FramePool {
    pools: Mutex<Pools>,
    memory: Arc<PhysicalMemory>,
    user_total: usize,
    supervisor_total: usize,
    user_used: AtomicUsize,
    supervisor_used: AtomicUsize,
}

impl FramePool {
    fn counter(&self, kind: PoolKind) -> &AtomicUsize {
        match kind {
            PoolKind::User => &self.user_used,
            PoolKind::Supervisor => &self.supervisor_used,
        }
    }

    fn release(&self, addr: PhysAddr, kind: PoolKind) {
        let mut pools = self.pools.lock();
        pools.region_of(kind, addr).return_page(addr);
        self.counter(kind).fetch_sub(1, Ordering::Relaxed);
        trace!("[MM] freed {:?} frame {}", kind, addr);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Pool(PoolKind),
    SharedZero,
}

struct PageFrame {
    addr: PhysAddr,
    kind: FrameKind,
    pool: Arc<FramePool>,
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        match self.kind {
            FrameKind::Pool(kind) => self.pool.release(self.addr, kind),
            FrameKind::SharedZero => {}
        }
    }
}

/// A reference-counted handle to one physical frame.
///
/// Cloning adds a reference; the frame returns to its pool when the last
/// handle is dropped.
#[derive(Clone)]
pub struct PhysicalPage(Arc<PageFrame>);

impl PhysicalPage {
    /// Physical address of the frame.
    #[inline]
    pub fn paddr(&self) -> PhysAddr {
        self.0.addr
    }

    /// Number of live handles to this frame.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub fn is_shared_zero_page(&self) -> bool {
        self.0.kind == FrameKind::SharedZero
    }

    /// Whether both handles refer to the same frame.
    #[inline]
    pub fn ptr_eq(&self, other: &PhysicalPage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage({}, refs={}{})",
            self.paddr(),
            self.ref_count(),
            if self.is_shared_zero_page() { ", zero" } else { "" }
        )
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemoryInfo {
    pub user_physical_pages: usize,
    pub user_physical_pages_used: usize,
    pub super_physical_pages: usize,
    pub super_physical_pages_used: usize,
}

/// The only component that hands out or reclaims physical memory.
pub struct PhysicalPageAllocator {
    pool: Arc<FramePool>,
    zero_page: PhysicalPage,
}

impl PhysicalPageAllocator {
    /// Carve the configured RAM into pools and reserve the shared zero page.
    ///
    /// # Panics
    /// Panics if a configured range is misaligned, lies outside the physical
    /// window, or the supervisor pool cannot hold the zero page.
    pub fn new(config: &MemoryConfig, memory: Arc<PhysicalMemory>) -> Self {
        let mut user = Vec::new();
        let mut supervisor = Vec::new();
        let mut supervisor_left = config.supervisor_pages;

        for range in &config.ranges {
            assert!(range.base.is_aligned(), "unaligned RAM range {:?}", range);
            let pages = range.page_count();
            if pages == 0 {
                continue;
            }
            assert!(
                memory.contains_frame(range.base)
                    && memory.contains_frame(range.base.add((pages - 1) << PAGE_SHIFT)),
                "RAM range {:?} outside physical window",
                range
            );

            let super_here = supervisor_left.min(pages);
            if super_here > 0 {
                supervisor.push(PhysicalRegion::new(range.base, super_here));
                supervisor_left -= super_here;
            }
            if pages > super_here {
                let base = range.base.add(super_here << PAGE_SHIFT);
                user.push(PhysicalRegion::new(base, pages - super_here));
            }
        }

        let user_total = user.iter().map(PhysicalRegion::pages).sum();
        let supervisor_total = supervisor.iter().map(PhysicalRegion::pages).sum();

        let pool = Arc::new(FramePool {
            pools: Mutex::new(Pools { user, supervisor }),
            memory,
            user_total,
            supervisor_total,
            user_used: AtomicUsize::new(0),
            supervisor_used: AtomicUsize::new(0),
        });

        let zero_addr = {
            let mut pools = pool.pools.lock();
            let addr = pools
                .supervisor
                .iter_mut()
                .find_map(PhysicalRegion::take_page);
            match addr {
                Some(addr) => addr,
                None => panic!("no supervisor page left for the shared zero page"),
            }
        };
        pool.supervisor_used.fetch_add(1, Ordering::Relaxed);
        // SAFETY: The frame was just taken from the pool; nobody else has it.
        unsafe { pool.memory.zero_frame(zero_addr) };
        let zero_page = PhysicalPage(Arc::new(PageFrame {
            addr: zero_addr,
            kind: FrameKind::SharedZero,
            pool: pool.clone(),
        }));

        info!(
            "[MM] physical pools: {} user pages, {} supervisor pages, zero page at {}",
            user_total, supervisor_total, zero_addr
        );

        Self { pool, zero_page }
    }

    /// The physical window frames are reached through.
    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.pool.memory
    }

    /// The shared, read-only zero page. Never freed.
    pub fn shared_zero_page(&self) -> PhysicalPage {
        self.zero_page.clone()
    }

    /// Allocate one frame from `kind`'s pool.
    ///
    /// Returns `None` when the pool is exhausted; callers must treat that as
    /// out-of-memory.
    pub fn allocate(&self, kind: PoolKind, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        let addr = {
            let mut pools = self.pool.pools.lock();
            let addr = pools.regions_mut(kind).iter_mut().find_map(PhysicalRegion::take_page);
            if addr.is_some() {
                self.pool.counter(kind).fetch_add(1, Ordering::Relaxed);
            }
            addr
        };

        let Some(addr) = addr else {
            warn!("[MM] {:?} physical pool exhausted", kind);
            return None;
        };

        if zero_fill == ShouldZeroFill::Yes {
            // SAFETY: The frame was just allocated so we have exclusive access.
            unsafe { self.pool.memory.zero_frame(addr) };
        }
        trace!("[MM] allocated {:?} frame {}", kind, addr);
        Some(self.wrap(addr, kind))
    }

    /// Allocate one user frame.
    pub fn allocate_user_page(&self, zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        self.allocate(PoolKind::User, zero_fill)
    }

    /// Allocate one zeroed supervisor frame.
    pub fn allocate_supervisor_page(&self) -> Option<PhysicalPage> {
        self.allocate(PoolKind::Supervisor, ShouldZeroFill::Yes)
    }

    /// Allocate `count` physically contiguous, zeroed supervisor frames.
    pub fn allocate_contiguous_supervisor_pages(
        &self,
        count: usize,
    ) -> Result<Vec<PhysicalPage>, VmError> {
        if count == 0 {
            return Err(VmError::InvalidSize);
        }
        let base = {
            let mut pools = self.pool.pools.lock();
            let base = pools
                .supervisor
                .iter_mut()
                .find_map(|region| region.take_contiguous(count));
            if base.is_some() {
                self.pool.supervisor_used.fetch_add(count, Ordering::Relaxed);
            }
            base
        };
        let Some(base) = base else {
            warn!("[MM] no run of {} contiguous supervisor pages", count);
            return Err(VmError::OutOfMemory);
        };

        Ok((0..count)
            .map(|i| {
                let addr = base.add(i * PAGE_SIZE);
                // SAFETY: Freshly allocated, exclusively ours.
                unsafe { self.pool.memory.zero_frame(addr) };
                self.wrap(addr, PoolKind::Supervisor)
            })
            .collect())
    }

    fn wrap(&self, addr: PhysAddr, kind: PoolKind) -> PhysicalPage {
        PhysicalPage(Arc::new(PageFrame {
            addr,
            kind: FrameKind::Pool(kind),
            pool: self.pool.clone(),
        }))
    }

    /// Whether `addr` is currently handed out. Frames outside both pools
    /// report `false`.
    pub fn is_allocated(&self, addr: PhysAddr) -> bool {
        let pools = self.pool.pools.lock();
        pools
            .user
            .iter()
            .chain(pools.supervisor.iter())
            .find(|r| r.contains(addr))
            .is_some_and(|r| r.is_allocated(addr))
    }

    /// Pool usage counters.
    pub fn info(&self) -> SystemMemoryInfo {
        SystemMemoryInfo {
            user_physical_pages: self.pool.user_total,
            user_physical_pages_used: self.pool.user_used.load(Ordering::Relaxed),
            super_physical_pages: self.pool.supervisor_total,
            super_physical_pages_used: self.pool.supervisor_used.load(Ordering::Relaxed),
        }
    }

    /// Number of free frames remaining in `kind`'s pool.
    pub fn free_pages(&self, kind: PoolKind) -> usize {
        let total = match kind {
            PoolKind::User => self.pool.user_total,
            PoolKind::Supervisor => self.pool.supervisor_total,
        };
        total - self.pool.counter(kind).load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostRam;

    fn allocator(user: usize, supervisor: usize) -> (HostRam, PhysicalPageAllocator) {
        let ram = HostRam::new(user + supervisor);
        let config = MemoryConfig::single_range(ram.base(), user + supervisor, supervisor);
        let allocator = PhysicalPageAllocator::new(&config, ram.memory());
        (ram, allocator)
    }

    #[test]
    fn test_pools_are_split_and_zero_page_reserved() {
        let (_ram, allocator) = allocator(8, 4);
        let info = allocator.info();
        assert_eq!(info.user_physical_pages, 8);
        assert_eq!(info.super_physical_pages, 4);
        assert_eq!(info.super_physical_pages_used, 1);
        assert!(allocator.shared_zero_page().is_shared_zero_page());
    }

    #[test]
    fn test_frame_returns_to_pool_on_last_drop() {
        let (_ram, allocator) = allocator(4, 2);
        let page = allocator.allocate_user_page(ShouldZeroFill::Yes).unwrap();
        let addr = page.paddr();
        let second = page.clone();
        assert_eq!(page.ref_count(), 2);
        assert!(allocator.is_allocated(addr));

        drop(page);
        assert!(allocator.is_allocated(addr));
        assert_eq!(second.ref_count(), 1);

        drop(second);
        assert!(!allocator.is_allocated(addr));
        assert_eq!(allocator.free_pages(PoolKind::User), 4);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let (_ram, allocator) = allocator(2, 2);
        let a = allocator.allocate_user_page(ShouldZeroFill::No);
        let b = allocator.allocate_user_page(ShouldZeroFill::No);
        assert!(a.is_some() && b.is_some());
        assert!(allocator.allocate_user_page(ShouldZeroFill::No).is_none());
        drop(a);
        assert!(allocator.allocate_user_page(ShouldZeroFill::No).is_some());
    }

    #[test]
    fn test_zero_fill_clears_previous_contents() {
        let (ram, allocator) = allocator(1, 1);
        let page = allocator.allocate_user_page(ShouldZeroFill::No).unwrap();
        let addr = page.paddr();
        // SAFETY: We own the only handle.
        unsafe { ram.memory().frame_mut(addr).fill(0xAA) };
        drop(page);

        let page = allocator.allocate_user_page(ShouldZeroFill::Yes).unwrap();
        assert_eq!(page.paddr(), addr);
        // SAFETY: We own the only handle.
        assert!(unsafe { ram.memory().frame_mut(addr) }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_contiguous_allocation() {
        let (_ram, allocator) = allocator(2, 6);
        let pages = allocator.allocate_contiguous_supervisor_pages(3).unwrap();
        for pair in pages.windows(2) {
            assert_eq!(pair[0].paddr().add(PAGE_SIZE), pair[1].paddr());
        }
        assert_eq!(allocator.info().super_physical_pages_used, 4);
        assert_eq!(
            allocator.allocate_contiguous_supervisor_pages(3).unwrap_err(),
            VmError::OutOfMemory
        );
    }

    #[test]
    fn test_zero_page_is_never_freed() {
        let (_ram, allocator) = allocator(1, 1);
        let zero = allocator.shared_zero_page();
        let addr = zero.paddr();
        drop(zero);
        assert!(allocator.is_allocated(addr));
    }
}
