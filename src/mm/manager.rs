//! Memory Manager
//!
//! The coordinator built once at boot and handed to everything that needs
//! virtual memory: it owns the physical allocator, the kernel address space,
//! the quickmap slots, the registries and the fault statistics.
//!
//! # Fault routing
//! - Non-canonical address: crash
//! - Kernel half: the kernel address space (kernel regions window only)
//! - User half: the faulting thread's address space

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, trace, warn};

use super::address::{page_round_up, PhysAddr, VirtAddr, VirtualRange, PAGE_SIZE};
use super::address_space::{AddressSpace, Placement};
use super::config::MemoryConfig;
use super::error::VmError;
use super::frame::{PhysicalPage, PhysicalPageAllocator, SystemMemoryInfo};
use super::inode::{Inode, InodeError, InodeId};
use super::page_directory::DirectoryKind;
use super::physical::PhysicalMemory;
use super::quickmap::{QuickMap, QuickMapGuard};
use super::region::{Access, RegionFlags};
use super::registry::{RegionId, Registry};
use super::vmobject::VmObject;
use crate::arch::Processor;
use crate::fault::{LandingPads, PageFault, PageFaultResponse};

/// Running fault counters.
#[derive(Default)]
pub struct FaultStats {
    total: AtomicUsize,
    cow: AtomicUsize,
    zero_fill: AtomicUsize,
    inode: AtomicUsize,
    failures: AtomicUsize,
}

/// A point-in-time copy of [`FaultStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub total: usize,
    pub cow: usize,
    pub zero_fill: usize,
    pub inode: usize,
    pub failures: usize,
}

impl FaultStats {
    fn record_fault(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inode_fault(&self) {
        self.inode.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FaultCounters {
        FaultCounters {
            total: self.total.load(Ordering::Relaxed),
            cow: self.cow.load(Ordering::Relaxed),
            zero_fill: self.zero_fill.load(Ordering::Relaxed),
            inode: self.inode.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// The virtual memory subsystem.
pub struct MemoryManager {
    allocator: PhysicalPageAllocator,
    processor: Arc<dyn Processor>,
    registry: Arc<Registry>,
    kernel_space: Arc<AddressSpace>,
    quickmap: QuickMap,
    landing_pads: LandingPads,
    stats: FaultStats,
}

impl MemoryManager {
    /// Bring up the allocator, the kernel address space and the quickmap.
    pub fn new(
        config: &MemoryConfig,
        memory: Arc<PhysicalMemory>,
        processor: Arc<dyn Processor>,
    ) -> Result<Arc<Self>, VmError> {
        let allocator = PhysicalPageAllocator::new(config, memory);
        let registry = Arc::new(Registry::new());
        let kernel_space =
            AddressSpace::new(&allocator, &registry, processor.clone(), DirectoryKind::Kernel)?;
        let quickmap = kernel_space
            .with_directory(|directory| QuickMap::new(directory, &allocator, processor.clone()))?;
        let landing_pads = LandingPads::new(processor.cpu_count());

        let info = allocator.info();
        info!(
            "[MM] initialized: {} user pages, {} supervisor pages, {} CPU(s)",
            info.user_physical_pages,
            info.super_physical_pages,
            processor.cpu_count()
        );

        Ok(Arc::new(Self {
            allocator,
            processor,
            registry,
            kernel_space,
            quickmap,
            landing_pads,
            stats: FaultStats::default(),
        }))
    }

    #[inline]
    pub fn allocator(&self) -> &PhysicalPageAllocator {
        &self.allocator
    }

    #[inline]
    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[inline]
    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    #[inline]
    pub fn quickmap(&self) -> &QuickMap {
        &self.quickmap
    }

    #[inline]
    pub fn landing_pads(&self) -> &LandingPads {
        &self.landing_pads
    }

    #[inline]
    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    pub fn system_memory_info(&self) -> SystemMemoryInfo {
        self.allocator.info()
    }

    /// A fresh, empty user address space.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, VmError> {
        AddressSpace::new(
            &self.allocator,
            &self.registry,
            self.processor.clone(),
            DirectoryKind::User,
        )
    }

    /// Whether `space` lets user mode read `[vaddr, vaddr + size)`.
    pub fn validate_user_read(&self, space: &AddressSpace, vaddr: VirtAddr, size: usize) -> bool {
        Self::validate_user_range(space, vaddr, size, Access::READ)
    }

    /// Whether `space` lets user mode write `[vaddr, vaddr + size)`.
    pub fn validate_user_write(&self, space: &AddressSpace, vaddr: VirtAddr, size: usize) -> bool {
        Self::validate_user_range(space, vaddr, size, Access::WRITE)
    }

    fn validate_user_range(space: &AddressSpace, vaddr: VirtAddr, size: usize, access: Access) -> bool {
        vaddr.is_user() && space.kind() == DirectoryKind::User && space.validate_range(vaddr, size, access)
    }

    /// Whether a user stack pointer lies in a mapped stack region.
    pub fn validate_user_stack(&self, space: &AddressSpace, vaddr: VirtAddr) -> bool {
        vaddr.is_user() && space.validate_stack(vaddr)
    }

    /// Anonymous kernel memory, allocated and zeroed up front.
    pub fn allocate_kernel_region(
        self: &Arc<Self>,
        size: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> Result<KernelRegion, VmError> {
        let pages = page_round_up(size)
            .filter(|&size| size > 0)
            .ok_or(VmError::InvalidSize)?
            / PAGE_SIZE;
        let vmobject = VmObject::anonymous_committed(&self.registry, &self.allocator, pages)?;
        self.allocate_kernel_region_with_vmobject(vmobject, size, name, access, cacheable)
    }

    /// Map a caller-supplied VMObject into the kernel regions window.
    pub fn allocate_kernel_region_with_vmobject(
        self: &Arc<Self>,
        vmobject: Arc<VmObject>,
        size: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> Result<KernelRegion, VmError> {
        let flags = if cacheable {
            RegionFlags::CACHEABLE
        } else {
            RegionFlags::empty()
        };
        self.place_kernel_region(vmobject, size, name, access, flags)
    }

    /// Kernel memory that user mode may also reach, for shared buffers.
    pub fn allocate_user_accessible_kernel_region(
        self: &Arc<Self>,
        size: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> Result<KernelRegion, VmError> {
        let pages = page_round_up(size)
            .filter(|&size| size > 0)
            .ok_or(VmError::InvalidSize)?
            / PAGE_SIZE;
        let vmobject = VmObject::anonymous_committed(&self.registry, &self.allocator, pages)?;
        let mut flags = RegionFlags::USER_ACCESSIBLE;
        if cacheable {
            flags |= RegionFlags::CACHEABLE;
        }
        self.place_kernel_region(vmobject, size, name, access, flags)
    }

    fn place_kernel_region(
        self: &Arc<Self>,
        vmobject: Arc<VmObject>,
        size: usize,
        name: &str,
        access: Access,
        flags: RegionFlags,
    ) -> Result<KernelRegion, VmError> {
        let range = self.kernel_space.allocate_region_with_vmobject(
            self,
            Placement::Anywhere,
            size,
            vmobject.clone(),
            0,
            name,
            access,
            flags,
        )?;
        Ok(KernelRegion {
            mm: self.clone(),
            range,
            vmobject,
        })
    }

    /// Lazily populated anonymous memory of `page_count` pages.
    pub fn allocate_anonymous_vmobject(&self, page_count: usize) -> Arc<VmObject> {
        VmObject::anonymous(&self.registry, page_count)
    }

    /// A physically contiguous object covering `size` bytes.
    pub fn allocate_contiguous_vmobject(&self, size: usize) -> Result<Arc<VmObject>, VmError> {
        let pages = page_round_up(size)
            .filter(|&size| size > 0)
            .ok_or(VmError::InvalidSize)?
            / PAGE_SIZE;
        VmObject::contiguous(&self.registry, &self.allocator, pages)
    }

    /// The one shared VMObject of `inode`.
    pub fn shared_inode_vmobject(&self, inode: Arc<dyn Inode>) -> Arc<VmObject> {
        let id = inode.id();
        self.registry
            .shared_inode_vmobject(id, || VmObject::from_inode(&self.registry, inode, true))
    }

    /// A new private copy-on-write view of `inode`.
    pub fn private_inode_vmobject(&self, inode: Arc<dyn Inode>) -> Arc<VmObject> {
        VmObject::from_inode(&self.registry, inode, false)
    }

    /// Map `page` into this CPU's quickmap slot.
    ///
    /// # Panics
    /// Panics if this CPU already holds its slot.
    pub fn quickmap_page(&self, page: &PhysicalPage) -> QuickMapGuard<'_> {
        self.quickmap.map(page.paddr())
    }

    /// Copy one frame into another. Only one quickmap slot is held at a
    /// time, so the data passes through a stack buffer.
    pub fn copy_physical_page(&self, src: &PhysicalPage, dst: &PhysicalPage) {
        let mut bounce = [0u8; PAGE_SIZE];
        bounce.copy_from_slice(self.quickmap_page(src).as_slice());
        self.quickmap_page(dst).as_mut_slice().copy_from_slice(&bounce);
    }

    /// Resolve `fault` against the region covering its address.
    ///
    /// `space` is the faulting thread's address space; it is only consulted
    /// for user-half addresses.
    pub fn handle_page_fault(&self, space: Option<&AddressSpace>, fault: &PageFault) -> PageFaultResponse {
        self.stats.record_fault();
        let vaddr = fault.vaddr();
        let response = if !vaddr.is_canonical() {
            debug!("[PAGEFAULT] non-canonical address {}", vaddr);
            PageFaultResponse::ShouldCrash
        } else if vaddr.is_kernel() {
            if self.kernel_space.window().contains(vaddr) {
                self.kernel_space.handle_fault(self, fault)
            } else {
                debug!("[PAGEFAULT] {} is outside the kernel regions window", vaddr);
                PageFaultResponse::ShouldCrash
            }
        } else {
            match space {
                Some(space) => space.handle_fault(self, fault),
                None => {
                    debug!("[PAGEFAULT] user address {} without an address space", vaddr);
                    PageFaultResponse::ShouldCrash
                }
            }
        };

        if response != PageFaultResponse::Continue {
            self.stats.record_failure();
        }
        trace!("[PAGEFAULT] {:?} {:?} at {} -> {:?}", fault.kind(), fault.access(), vaddr, response);
        response
    }

    /// Write every resident page of a shared inode object back to its
    /// inode. Returns the number of pages written.
    pub fn sync_vmobject(&self, vmobject: &VmObject) -> Result<usize, InodeError> {
        vmobject.write_back(|page, bounce| {
            bounce.copy_from_slice(self.quickmap_page(page).as_slice())
        })
    }

    /// Pick up an external write to page `page_index` of `inode`.
    ///
    /// If the inode's shared VMObject has the page resident, it is re-read
    /// in place and every mapper's translation is refreshed. Returns whether
    /// a resident page was updated.
    pub fn inode_page_changed(&self, inode: InodeId, page_index: usize) -> Result<bool, InodeError> {
        let Some(vmobject) = self.registry.lookup_shared_inode(inode) else {
            return Ok(false);
        };
        if page_index >= vmobject.page_count() {
            return Ok(false);
        }
        let Some(page) = vmobject.physical_page(page_index) else {
            return Ok(false);
        };
        let Some(backing) = vmobject.inode() else {
            return Ok(false);
        };
        let bytes = backing.read_page(page_index)?;
        {
            let mut frame = self.quickmap_page(&page);
            let frame = frame.as_mut_slice();
            let len = bytes.len().min(PAGE_SIZE);
            frame[..len].copy_from_slice(&bytes[..len]);
            frame[len..].fill(0);
        }
        drop(page);

        let refreshed = self.refresh_mappers(&vmobject, page_index, None);
        debug!(
            "[MM] {:?} page {} changed, {} mapping(s) refreshed",
            inode, page_index, refreshed
        );
        Ok(true)
    }

    /// Reinstall slot `index` of `vmobject` in every region mapping it,
    /// except `skip`. Returns the number of regions refreshed.
    ///
    /// Takes each address space's lock in turn; the caller must hold none.
    pub(crate) fn refresh_mappers(
        &self,
        vmobject: &VmObject,
        index: usize,
        skip: Option<RegionId>,
    ) -> usize {
        let mut refreshed = 0;
        vmobject.for_each_region(|region, directory| {
            let first = region.first_page_index();
            if Some(region.id()) == skip
                || index < first
                || index >= first + region.page_count()
            {
                return;
            }
            match region.map_individual_page(self, directory, index - first) {
                Ok(()) => refreshed += 1,
                Err(err) => warn!("[MM] refreshing {} failed: {}", region.name(), err),
            }
        });
        if refreshed > 0 {
            trace!("[MM] {:?} slot {}: {} mapper(s) refreshed", vmobject.id(), index, refreshed);
        }
        refreshed
    }
}

/// A mapping in the kernel regions window, removed when dropped.
pub struct KernelRegion {
    mm: Arc<MemoryManager>,
    range: VirtualRange,
    vmobject: Arc<VmObject>,
}

impl KernelRegion {
    #[inline]
    pub fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    pub fn vaddr(&self) -> VirtAddr {
        self.range.base()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn vmobject(&self) -> &Arc<VmObject> {
        &self.vmobject
    }

    /// Physical address behind `vaddr`, if mapped.
    pub fn physical_address(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        if !self.range.contains(vaddr) {
            return None;
        }
        self.mm.kernel_space.translate(vaddr)
    }
}

impl Drop for KernelRegion {
    fn drop(&mut self) {
        if let Err(err) = self.mm.kernel_space.deallocate_region(&self.mm, self.range.base()) {
            warn!("[MM] dropping kernel region {:?} failed: {}", self.range, err);
        }
    }
}
