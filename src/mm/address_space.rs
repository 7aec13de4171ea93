//! Address Spaces
//!
//! An address space owns one page directory and the non-overlapping set of
//! regions mapped into it. One lock guards both; a region's fault handler
//! runs with that lock held, so faults in one address space serialize while
//! different address spaces proceed in parallel.
//!
//! # Security Properties
//! - User address spaces only hold user-accessible regions inside
//!   `USER_RANGE_BASE..USER_RANGE_END`
//! - Region ranges never overlap; fixed placements that would overlap are
//!   refused
//! - Teardown unmaps everything and flushes every CPU's TLB before the page
//!   tables are freed
//! - Writable shared file mappings are written back on teardown as on
//!   `deallocate_region`

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, warn};
use spin::Mutex;

use super::address::{
    page_round_up, PhysAddr, VirtAddr, VirtualRange, KERNEL_REGION_BASE, KERNEL_REGION_SIZE,
    PAGE_SIZE, USER_RANGE_BASE, USER_RANGE_END,
};
use super::error::VmError;
use super::frame::PhysicalPageAllocator;
use super::inode::Inode;
use super::manager::MemoryManager;
use super::page_directory::{DirectoryKind, PageDirectory};
use super::paging::PageTableEntry;
use super::physical::PhysicalMemory;
use super::region::{Access, Region, RegionFlags};
use super::registry::{AddressSpaceId, RegionId, Registry, VmObjectId};
use super::vmobject::VmObject;
use crate::arch::Processor;
use crate::fault::{PageFault, PageFaultResponse};

/// Where a new region goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Lowest free range that fits.
    Anywhere,
    /// Exactly here; fails if anything is in the way.
    Fixed(VirtAddr),
}

/// Snapshot of one region for callers outside the address-space lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub range: VirtualRange,
    pub name: String,
    pub access: Access,
    pub flags: RegionFlags,
    pub vmobject: VmObjectId,
    pub resident: usize,
}

impl RegionInfo {
    fn of(region: &Region) -> Self {
        Self {
            id: region.id(),
            range: region.range(),
            name: String::from(region.name()),
            access: region.access(),
            flags: region.flags(),
            vmobject: region.vmobject().id(),
            resident: region.amount_resident(),
        }
    }
}

struct Inner {
    directory: PageDirectory,
    /// Keyed by base address.
    regions: BTreeMap<usize, Region>,
}

impl Inner {
    fn region_containing(&mut self, vaddr: VirtAddr) -> Option<&mut Region> {
        self.regions
            .range_mut(..=vaddr.as_usize())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(vaddr))
    }

    fn overlaps(&self, range: &VirtualRange) -> bool {
        let before = self
            .regions
            .range(..range.base().as_usize())
            .next_back()
            .is_some_and(|(_, r)| r.range().intersects(range));
        let after = self
            .regions
            .range(range.base().as_usize()..)
            .next()
            .is_some_and(|(_, r)| r.range().intersects(range));
        before || after
    }

    fn find_free(&self, window: &VirtualRange, size: usize) -> Option<VirtualRange> {
        let mut candidate = window.base().as_usize();
        for region in self.regions.values() {
            let base = region.base().as_usize();
            if candidate.checked_add(size)? <= base {
                break;
            }
            candidate = candidate.max(region.range().end().as_usize());
        }
        let range = VirtualRange::new(VirtAddr::new(candidate), size)?;
        (range.end().as_usize() <= window.end().as_usize()).then_some(range)
    }
}

/// One process's (or the kernel's) view of memory.
pub struct AddressSpace {
    id: AddressSpaceId,
    kind: DirectoryKind,
    window: VirtualRange,
    root: PhysAddr,
    inner: Mutex<Inner>,
    registry: Arc<Registry>,
    processor: Arc<dyn Processor>,
    memory: Arc<PhysicalMemory>,
}

impl AddressSpace {
    pub(crate) fn new(
        allocator: &PhysicalPageAllocator,
        registry: &Arc<Registry>,
        processor: Arc<dyn Processor>,
        kind: DirectoryKind,
    ) -> Result<Arc<Self>, VmError> {
        let directory = PageDirectory::new(allocator, kind)?;
        let window = match kind {
            DirectoryKind::User => {
                VirtualRange::new(VirtAddr::new(USER_RANGE_BASE), USER_RANGE_END - USER_RANGE_BASE)
            }
            DirectoryKind::Kernel => {
                VirtualRange::new(VirtAddr::new(KERNEL_REGION_BASE), KERNEL_REGION_SIZE)
            }
        }
        .ok_or(VmError::InvalidSize)?;

        let space = Arc::new(Self {
            id: registry.next_space_id(),
            kind,
            window,
            root: directory.root(),
            inner: Mutex::new(Inner {
                directory,
                regions: BTreeMap::new(),
            }),
            registry: registry.clone(),
            processor,
            memory: allocator.memory().clone(),
        });
        registry.register_space(&space);
        info!("[MM] created {:?} address space {:?}, root {}", kind, space.id, space.root);
        Ok(space)
    }

    #[inline]
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// Physical address of the root table, for TTBRn_EL1.
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// The virtual window regions may be placed in.
    #[inline]
    pub fn window(&self) -> VirtualRange {
        self.window
    }

    /// Map `size` bytes of `vmobject` starting at `offset` (both rounded to
    /// pages) and install every resident page.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_region_with_vmobject(
        &self,
        mm: &MemoryManager,
        placement: Placement,
        size: usize,
        vmobject: Arc<VmObject>,
        offset: usize,
        name: &str,
        access: Access,
        flags: RegionFlags,
    ) -> Result<VirtualRange, VmError> {
        let size = page_round_up(size)
            .filter(|&size| size > 0)
            .ok_or(VmError::InvalidSize)?;
        if offset % PAGE_SIZE != 0 {
            return Err(VmError::MisalignedAddress);
        }
        if offset / PAGE_SIZE + size / PAGE_SIZE > vmobject.page_count() {
            return Err(VmError::InvalidSize);
        }
        if self.kind == DirectoryKind::User && !flags.contains(RegionFlags::USER_ACCESSIBLE) {
            return Err(VmError::InvalidPermissions);
        }

        let mut inner = self.inner.lock();
        let range = match placement {
            Placement::Anywhere => inner
                .find_free(&self.window, size)
                .ok_or(VmError::OutOfRange)?,
            Placement::Fixed(base) => {
                let range = VirtualRange::new(base, size).ok_or(VmError::MisalignedAddress)?;
                if !self.window.contains_span(range.base(), range.size()) {
                    return Err(VmError::InvalidPermissions);
                }
                if inner.overlaps(&range) {
                    return Err(VmError::RangeOverlap);
                }
                range
            }
        };

        let mut region =
            Region::new(&self.registry, self.id, range, vmobject, offset, name, access, flags);
        let Inner { directory, regions } = &mut *inner;
        if let Err(err) = region.map(mm, directory) {
            warn!("[MM] mapping {} {:?} failed: {}", name, range, err);
            region.unmap(mm, directory);
            return Err(err);
        }
        debug!("[MM] {:?}: new region {} {:?} {:?}", self.id, name, range, access);
        let previous = regions.insert(range.base().as_usize(), region);
        assert!(previous.is_none(), "region overlap at {:?}", range);
        Ok(range)
    }

    /// Lazily populated anonymous memory.
    pub fn allocate_region(
        &self,
        mm: &MemoryManager,
        placement: Placement,
        size: usize,
        name: &str,
        access: Access,
        flags: RegionFlags,
    ) -> Result<VirtualRange, VmError> {
        let pages = page_round_up(size).ok_or(VmError::InvalidSize)? / PAGE_SIZE;
        let vmobject = mm.allocate_anonymous_vmobject(pages);
        self.allocate_region_with_vmobject(mm, placement, size, vmobject, 0, name, access, flags)
    }

    /// Map part of a file. Shared mappings use the inode's one shared
    /// VMObject; private ones get their own copy-on-write view.
    #[allow(clippy::too_many_arguments)]
    pub fn map_inode(
        &self,
        mm: &MemoryManager,
        placement: Placement,
        inode: Arc<dyn Inode>,
        offset: usize,
        size: usize,
        name: &str,
        access: Access,
        shared: bool,
    ) -> Result<VirtualRange, VmError> {
        let vmobject = if shared {
            mm.shared_inode_vmobject(inode)
        } else {
            mm.private_inode_vmobject(inode)
        };
        let mut flags = RegionFlags::CACHEABLE;
        if self.kind == DirectoryKind::User {
            flags |= RegionFlags::USER_ACCESSIBLE;
        }
        if shared {
            flags |= RegionFlags::SHARED;
        }
        self.allocate_region_with_vmobject(mm, placement, size, vmobject, offset, name, access, flags)
    }

    /// Unmap and drop the region starting at `base`. Writable shared inode
    /// mappings are written back first.
    pub fn deallocate_region(&self, mm: &MemoryManager, base: VirtAddr) -> Result<(), VmError> {
        let region = {
            let mut inner = self.inner.lock();
            let Inner { directory, regions } = &mut *inner;
            let mut region = regions.remove(&base.as_usize()).ok_or(VmError::NotMapped)?;
            region.unmap(mm, directory);
            region
        };
        debug!("[MM] {:?}: dropped region {} {:?}", self.id, region.name(), region.range());
        if region.is_writable() && region.vmobject().is_shared_inode() {
            if let Err(err) = mm.sync_vmobject(region.vmobject()) {
                warn!("[MM] writeback of {} failed: {}", region.name(), err);
            }
        }
        Ok(())
    }

    /// Change the access rights of the region at `base` and remap it.
    pub fn set_region_access(
        &self,
        mm: &MemoryManager,
        base: VirtAddr,
        access: Access,
    ) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let Inner { directory, regions } = &mut *inner;
        let region = regions.get_mut(&base.as_usize()).ok_or(VmError::NotMapped)?;
        region.set_access(access);
        region.remap(mm, directory)
    }

    /// Resolve a fault against the region covering its address.
    ///
    /// When the fault swapped the page in a VMObject slot, every other
    /// region mapping that slot is refreshed after this space's lock is
    /// released.
    pub fn handle_fault(&self, mm: &MemoryManager, fault: &PageFault) -> PageFaultResponse {
        let (response, replaced) = {
            let mut inner = self.inner.lock();
            let Inner { directory, regions } = &mut *inner;
            let vaddr = fault.vaddr();
            let region = regions
                .range_mut(..=vaddr.as_usize())
                .next_back()
                .map(|(_, region)| region)
                .filter(|region| region.contains(vaddr));
            match region {
                Some(region) => {
                    let (response, slot) = region.resolve_fault(mm, directory, fault);
                    let replaced = slot.map(|slot| (region.vmobject().clone(), slot, region.id()));
                    (response, replaced)
                }
                None => {
                    debug!("[PAGEFAULT] {:?}: no region covers {}", self.id, vaddr);
                    (PageFaultResponse::ShouldCrash, None)
                }
            }
        };
        if let Some((vmobject, slot, faulting)) = replaced {
            mm.refresh_mappers(&vmobject, slot, Some(faulting));
        }
        response
    }

    /// Duplicate this address space for fork.
    pub fn clone_for_fork(&self, mm: &MemoryManager) -> Result<Arc<AddressSpace>, VmError> {
        let child = AddressSpace::new(mm.allocator(), &self.registry, self.processor.clone(), self.kind)?;
        {
            let mut inner = self.inner.lock();
            let Inner { directory, regions } = &mut *inner;
            let mut child_inner = child.inner.lock();
            for region in regions.values_mut() {
                let mut clone = region.clone_for_fork(mm, directory, child.id)?;
                clone.map(mm, &mut child_inner.directory)?;
                child_inner.regions.insert(clone.base().as_usize(), clone);
            }
        }
        info!("[MM] {:?} forked into {:?}", self.id, child.id);
        Ok(child)
    }

    /// Run `f` on the region with handle `id`, if it lives here.
    pub fn with_region<R>(
        &self,
        id: RegionId,
        f: impl FnOnce(&mut Region, &mut PageDirectory) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        let Inner { directory, regions } = &mut *inner;
        let region = regions.values_mut().find(|region| region.id() == id)?;
        Some(f(region, directory))
    }

    /// Run `f` on the region covering `vaddr`.
    pub fn with_region_containing<R>(
        &self,
        vaddr: VirtAddr,
        f: impl FnOnce(&mut Region, &mut PageDirectory) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        let Inner { directory, regions } = &mut *inner;
        let region = regions
            .range_mut(..=vaddr.as_usize())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(vaddr))?;
        Some(f(region, directory))
    }

    pub fn find_region_containing(&self, vaddr: VirtAddr) -> Option<RegionInfo> {
        self.inner
            .lock()
            .region_containing(vaddr)
            .map(|region| RegionInfo::of(region))
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.inner.lock().regions.values().map(RegionInfo::of).collect()
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Resident pages over all regions, zero page excluded.
    pub fn amount_resident(&self) -> usize {
        self.inner
            .lock()
            .regions
            .values()
            .map(Region::amount_resident)
            .sum()
    }

    /// Whether `[vaddr, vaddr + size)` is covered by regions that all grant
    /// `access` and are reachable from user mode.
    pub fn validate_range(&self, vaddr: VirtAddr, size: usize, access: Access) -> bool {
        let Some(end) = vaddr.as_usize().checked_add(size) else {
            return false;
        };
        if !self.window.contains_span(vaddr, size) {
            return false;
        }
        let mut inner = self.inner.lock();
        let mut cursor = vaddr;
        while cursor.as_usize() < end {
            let Some(region) = inner.region_containing(cursor) else {
                return false;
            };
            if !region.access().contains(access) || !region.is_user_accessible() {
                return false;
            }
            cursor = region.range().end();
        }
        true
    }

    /// Whether `vaddr` lies in a user-accessible stack region.
    pub fn validate_stack(&self, vaddr: VirtAddr) -> bool {
        self.inner
            .lock()
            .region_containing(vaddr)
            .is_some_and(|region| region.is_stack() && region.is_user_accessible())
    }

    /// Run `f` on the leaf entry for `vaddr` with the lock held, so the frame
    /// it names cannot be unmapped meanwhile.
    pub fn with_translation<R>(
        &self,
        vaddr: VirtAddr,
        f: impl FnOnce(Option<PageTableEntry>) -> R,
    ) -> R {
        let inner = self.inner.lock();
        f(inner.directory.entry(vaddr))
    }

    /// Like [`with_translation`](Self::with_translation), but gives up with
    /// `None` instead of spinning when the lock is held.
    pub fn try_with_translation<R>(
        &self,
        vaddr: VirtAddr,
        f: impl FnOnce(Option<PageTableEntry>) -> R,
    ) -> Option<R> {
        let inner = self.inner.try_lock()?;
        Some(f(inner.directory.entry(vaddr)))
    }

    pub(crate) fn with_directory<R>(&self, f: impl FnOnce(&mut PageDirectory) -> R) -> R {
        f(&mut self.inner.lock().directory)
    }

    pub fn entry(&self, vaddr: VirtAddr) -> Option<PageTableEntry> {
        self.inner.lock().directory.entry(vaddr)
    }

    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.inner.lock().directory.translate(vaddr)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        info!(
            "[MM] tearing down address space {:?} ({} regions)",
            self.id,
            inner.regions.len()
        );
        self.processor.flush_tlb_all();

        let mut dirty: Vec<Arc<VmObject>> = Vec::new();
        for region in core::mem::take(&mut inner.regions).into_values() {
            let vmobject = region.vmobject();
            if region.is_writable()
                && vmobject.is_shared_inode()
                && !dirty.iter().any(|object| object.id() == vmobject.id())
            {
                dirty.push(vmobject.clone());
            }
        }
        for vmobject in dirty {
            let memory = &self.memory;
            if let Err(err) =
                vmobject.write_back(|page, bounce| memory.read_frame(page.paddr(), bounce))
            {
                warn!("[MM] writeback of {:?} at teardown failed: {}", vmobject.id(), err);
            }
        }
        self.registry.unregister_space(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{AccessKind, ExecutionMode, FaultKind};
    use crate::testing::Machine;

    fn user(machine: &Machine) -> Arc<AddressSpace> {
        machine.mm.create_address_space().unwrap()
    }

    #[test]
    fn test_first_fit_skips_occupied_ranges() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        let a = space
            .allocate_region(mm, Placement::Anywhere, PAGE_SIZE, "a", Access::READ, RegionFlags::USER)
            .unwrap();
        assert_eq!(a.base().as_usize(), USER_RANGE_BASE);
        let fixed = VirtAddr::new(USER_RANGE_BASE + 3 * PAGE_SIZE);
        space
            .allocate_region(mm, Placement::Fixed(fixed), PAGE_SIZE, "b", Access::READ, RegionFlags::USER)
            .unwrap();

        let c = space
            .allocate_region(mm, Placement::Anywhere, 2 * PAGE_SIZE, "c", Access::READ, RegionFlags::USER)
            .unwrap();
        assert_eq!(c.base().as_usize(), USER_RANGE_BASE + PAGE_SIZE);
        let d = space
            .allocate_region(mm, Placement::Anywhere, 2 * PAGE_SIZE, "d", Access::READ, RegionFlags::USER)
            .unwrap();
        assert_eq!(d.base().as_usize(), USER_RANGE_BASE + 4 * PAGE_SIZE);
        assert_eq!(space.region_count(), 4);
    }

    #[test]
    fn test_fixed_placement_is_checked() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        let base = VirtAddr::new(0x10_0000);
        space
            .allocate_region(mm, Placement::Fixed(base), 2 * PAGE_SIZE, "a", Access::READ, RegionFlags::USER)
            .unwrap();

        let place = |addr: usize, size: usize| {
            space.allocate_region(
                mm,
                Placement::Fixed(VirtAddr::new(addr)),
                size,
                "x",
                Access::READ,
                RegionFlags::USER,
            )
        };
        assert_eq!(place(0x10_1000, PAGE_SIZE), Err(VmError::RangeOverlap));
        assert_eq!(place(0x0F_F000, 2 * PAGE_SIZE), Err(VmError::RangeOverlap));
        assert_eq!(place(0x10_0800, PAGE_SIZE), Err(VmError::MisalignedAddress));
        assert_eq!(place(0, PAGE_SIZE), Err(VmError::InvalidPermissions));
        assert_eq!(place(KERNEL_REGION_BASE, PAGE_SIZE), Err(VmError::InvalidPermissions));
        assert_eq!(place(0x20_0000, 0), Err(VmError::InvalidSize));
        assert!(place(0x10_2000, PAGE_SIZE).is_ok());
        assert_eq!(mm.registry().region_count(), 2);
    }

    #[test]
    fn test_user_spaces_only_take_user_regions() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        let objects = mm.registry().vmobject_count();
        assert_eq!(
            space.allocate_region(mm, Placement::Anywhere, PAGE_SIZE, "k", Access::READ, RegionFlags::CACHEABLE),
            Err(VmError::InvalidPermissions)
        );
        assert_eq!(space.region_count(), 0);
        assert_eq!(mm.registry().vmobject_count(), objects);
    }

    #[test]
    fn test_deallocation_unmaps_and_frees() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        let used = mm.system_memory_info().user_physical_pages_used;
        let range = space
            .allocate_region(mm, Placement::Anywhere, PAGE_SIZE, "a", Access::READ_WRITE, RegionFlags::USER)
            .unwrap();
        let fault = PageFault::new(range.base(), FaultKind::PageNotPresent, AccessKind::Write, ExecutionMode::User);
        assert_eq!(space.handle_fault(mm, &fault), PageFaultResponse::Continue);
        assert_eq!(mm.system_memory_info().user_physical_pages_used, used + 1);

        space.deallocate_region(mm, range.base()).unwrap();
        assert!(space.translate(range.base()).is_none());
        assert!(space.find_region_containing(range.base()).is_none());
        assert_eq!(mm.system_memory_info().user_physical_pages_used, used);
        assert_eq!(space.deallocate_region(mm, range.base()), Err(VmError::NotMapped));
    }

    #[test]
    fn test_access_changes_take_effect_immediately() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        let range = space
            .allocate_region(mm, Placement::Anywhere, PAGE_SIZE, "a", Access::READ_WRITE, RegionFlags::USER)
            .unwrap();
        let write = PageFault::new(range.base(), FaultKind::PageNotPresent, AccessKind::Write, ExecutionMode::User);
        space.handle_fault(mm, &write);
        assert!(space.entry(range.base()).unwrap().is_writable());

        space.set_region_access(mm, range.base(), Access::READ).unwrap();
        assert!(!space.entry(range.base()).unwrap().is_writable());
        let info = space.find_region_containing(range.base().add(100)).unwrap();
        assert_eq!(info.access, Access::READ);
        assert_eq!(info.resident, 1);
        assert_eq!(
            space.set_region_access(mm, VirtAddr::new(0x7000_0000), Access::READ),
            Err(VmError::NotMapped)
        );
    }

    #[test]
    fn test_stack_validation_needs_a_stack_region() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        let stack = space
            .allocate_region(
                mm,
                Placement::Anywhere,
                2 * PAGE_SIZE,
                "stack",
                Access::READ_WRITE,
                RegionFlags::USER | RegionFlags::STACK,
            )
            .unwrap();
        assert!(space.validate_stack(stack.base().add(PAGE_SIZE + 8)));
        assert!(!space.validate_stack(stack.end()));
        assert!(space.validate_range(stack.base(), stack.size(), Access::READ_WRITE));
    }

    #[test]
    fn test_fork_copies_every_region() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let space = user(&machine);
        space
            .allocate_region(mm, Placement::Anywhere, 2 * PAGE_SIZE, "heap", Access::READ_WRITE, RegionFlags::USER)
            .unwrap();
        space
            .allocate_region(
                mm,
                Placement::Anywhere,
                PAGE_SIZE,
                "shm",
                Access::READ_WRITE,
                RegionFlags::USER | RegionFlags::SHARED,
            )
            .unwrap();
        let child = space.clone_for_fork(mm).unwrap();
        assert_ne!(child.id(), space.id());
        assert_ne!(child.root(), space.root());

        let parents = space.regions();
        let children = child.regions();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].range, parents[0].range);
        assert_ne!(children[0].vmobject, parents[0].vmobject);
        assert_eq!(children[1].vmobject, parents[1].vmobject);
        assert_eq!(mm.registry().region_count(), 4);
    }
}
