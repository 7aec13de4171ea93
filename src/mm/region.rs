//! Regions
//!
//! A region maps a page-aligned virtual range of one address space onto a
//! slice of a VMObject, with access rights and a lazily allocated per-page
//! copy-on-write bitmap.
//!
//! # Fault resolution
//! 1. Write to a page marked COW (or to the shared zero page): duplicate
//!    the frame unless this mapping is its only user, then map writable
//! 2. Slot absent: fill it from the VMObject (zero page, zeroed frame, or
//!    inode read) and map it
//! 3. Slot resident but not mapped here yet: map it
//! 4. Anything else is a protection violation
//!
//! Every method that touches translations runs with the owning address
//! space's lock held; the caller passes in its page directory.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;
use log::{debug, trace, warn};

use super::address::{VirtAddr, VirtualRange, PAGE_SHIFT, PAGE_SIZE};
use super::bitmap::Bitmap;
use super::error::VmError;
use super::frame::{PhysicalPage, ShouldZeroFill};
use super::manager::MemoryManager;
use super::page_directory::PageDirectory;
use super::paging::PageFlags;
use super::registry::{AddressSpaceId, RegionId, RegionRecord, Registry};
use super::vmobject::{PopulateError, VmObject};
use crate::arch::flush_tlb;
use crate::fault::{ExecutionMode, PageFault, PageFaultResponse};

bitflags! {
    /// Access rights of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
}

bitflags! {
    /// Mapping properties of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u8 {
        /// Writes are visible to every mapper of the VMObject; fork shares
        /// the object instead of copying it.
        const SHARED = 1 << 0;
        const CACHEABLE = 1 << 1;
        /// Reachable from EL0.
        const USER_ACCESSIBLE = 1 << 2;
        /// A thread stack; stack pointers must point into one.
        const STACK = 1 << 3;
    }
}

impl RegionFlags {
    /// Private, cacheable user memory.
    pub const USER: Self = Self::CACHEABLE.union(Self::USER_ACCESSIBLE);
}

/// One mapping of a VMObject slice into one address space.
pub struct Region {
    id: RegionId,
    space: AddressSpaceId,
    range: VirtualRange,
    offset_in_vmobject: usize,
    vmobject: Arc<VmObject>,
    access: Access,
    flags: RegionFlags,
    name: String,
    cow_map: Option<Bitmap>,
    mapped: bool,
    registry: Arc<Registry>,
}

impl Region {
    /// Create and register a region. Nothing is mapped yet.
    ///
    /// # Panics
    /// Panics if the offset is unaligned or the range runs past the end of
    /// the VMObject.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: &Arc<Registry>,
        space: AddressSpaceId,
        range: VirtualRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: &str,
        access: Access,
        flags: RegionFlags,
    ) -> Self {
        assert!(
            offset_in_vmobject % PAGE_SIZE == 0,
            "unaligned VMObject offset {:#x}",
            offset_in_vmobject
        );
        let first = offset_in_vmobject >> PAGE_SHIFT;
        assert!(
            first + range.page_count() <= vmobject.page_count(),
            "region {:?} overruns {:?}",
            range,
            vmobject
        );

        let id = registry.next_region_id();
        registry.register_region(
            id,
            RegionRecord {
                space,
                vmobject: vmobject.id(),
                range,
            },
        );
        Self {
            id,
            space,
            range,
            offset_in_vmobject,
            vmobject,
            access,
            flags,
            name: String::from(name),
            cow_map: None,
            mapped: false,
            registry: registry.clone(),
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    pub fn space(&self) -> AddressSpaceId {
        self.space
    }

    #[inline]
    pub fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    pub fn base(&self) -> VirtAddr {
        self.range.base()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.range.size()
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.range.page_count()
    }

    /// Index of the region's first page within its VMObject.
    #[inline]
    pub fn first_page_index(&self) -> usize {
        self.offset_in_vmobject >> PAGE_SHIFT
    }

    #[inline]
    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn access(&self) -> Access {
        self.access
    }

    #[inline]
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn vmobject(&self) -> &Arc<VmObject> {
        &self.vmobject
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED)
    }

    pub fn is_cacheable(&self) -> bool {
        self.flags.contains(RegionFlags::CACHEABLE)
    }

    pub fn is_user_accessible(&self) -> bool {
        self.flags.contains(RegionFlags::USER_ACCESSIBLE)
    }

    pub fn is_stack(&self) -> bool {
        self.flags.contains(RegionFlags::STACK)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    #[inline]
    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.range.contains(vaddr)
    }

    /// Region-relative page index of `vaddr`.
    #[inline]
    pub fn page_index_of(&self, vaddr: VirtAddr) -> usize {
        (vaddr.as_usize() - self.base().as_usize()) >> PAGE_SHIFT
    }

    #[inline]
    pub fn vaddr_of_page(&self, page_index: usize) -> VirtAddr {
        self.base().add(page_index * PAGE_SIZE)
    }

    #[inline]
    pub fn translate_to_vmobject_page(&self, page_index: usize) -> usize {
        self.first_page_index() + page_index
    }

    /// The frame behind region page `page_index`, if resident.
    pub fn physical_page(&self, page_index: usize) -> Option<PhysicalPage> {
        self.vmobject
            .physical_page(self.translate_to_vmobject_page(page_index))
    }

    pub(crate) fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    pub fn should_cow(&self, page_index: usize) -> bool {
        self.cow_map
            .as_ref()
            .is_some_and(|map| map.get(page_index))
    }

    /// Mark or clear copy-on-write for one page. The bitmap is allocated on
    /// the first mark.
    pub fn set_should_cow(&mut self, page_index: usize, cow: bool) {
        assert!(page_index < self.page_count(), "page {} outside region", page_index);
        match &mut self.cow_map {
            Some(map) => map.set(page_index, cow),
            None if cow => {
                let mut map = Bitmap::new(self.page_count(), false);
                map.set(page_index, true);
                self.cow_map = Some(map);
            }
            None => {}
        }
    }

    /// Whether the per-page COW bitmap has been allocated.
    pub fn has_cow_map(&self) -> bool {
        self.cow_map.is_some()
    }

    /// Resident pages of this region's slice, zero page excluded.
    pub fn amount_resident(&self) -> usize {
        (0..self.page_count())
            .filter_map(|i| self.physical_page(i))
            .filter(|page| !page.is_shared_zero_page())
            .count()
    }

    /// Resident pages that are also referenced elsewhere.
    pub fn amount_shared(&self) -> usize {
        (0..self.page_count())
            .filter_map(|i| self.physical_page(i))
            .filter(|page| !page.is_shared_zero_page() && page.ref_count() > 2)
            .count()
    }

    fn leaf_flags(&self, page_index: usize, page: &PhysicalPage) -> PageFlags {
        let writable =
            self.is_writable() && !self.should_cow(page_index) && !page.is_shared_zero_page();
        PageFlags::leaf(
            writable,
            self.is_executable(),
            self.is_user_accessible(),
            self.is_cacheable(),
        )
    }

    /// Install (or refresh) the translation for one page. An absent slot
    /// removes any stale translation.
    pub fn map_individual_page(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        page_index: usize,
    ) -> Result<(), VmError> {
        let vaddr = self.vaddr_of_page(page_index);
        let Some(page) = self.physical_page(page_index) else {
            if directory.unmap_page(vaddr).is_some() {
                flush_tlb(mm.processor(), vaddr, 1);
            }
            return Ok(());
        };
        let flags = self.leaf_flags(page_index, &page);
        let previous = directory.map_page(mm.allocator(), vaddr, page.paddr(), flags)?;
        if previous.is_valid() {
            flush_tlb(mm.processor(), vaddr, 1);
        }
        trace!("[MM] {} map {} -> {} {:?}", self.name, vaddr, page.paddr(), flags);
        self.mapped = true;
        Ok(())
    }

    /// Map every resident page.
    pub fn map(&mut self, mm: &MemoryManager, directory: &mut PageDirectory) -> Result<(), VmError> {
        debug!("[MM] map {} {:?}", self.name, self.range);
        for page_index in 0..self.page_count() {
            if self.physical_page(page_index).is_some() {
                self.map_individual_page(mm, directory, page_index)?;
            }
        }
        self.mapped = true;
        Ok(())
    }

    /// Remove every translation of the region. Calling it again is a no-op.
    pub fn unmap(&mut self, mm: &MemoryManager, directory: &mut PageDirectory) {
        if !self.mapped {
            return;
        }
        debug!("[MM] unmap {} {:?}", self.name, self.range);
        let mut removed = 0;
        for page_index in 0..self.page_count() {
            if directory.unmap_page(self.vaddr_of_page(page_index)).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            flush_tlb(mm.processor(), self.base(), self.page_count());
        }
        self.mapped = false;
    }

    /// Re-install every translation, picking up access or COW changes.
    pub fn remap(&mut self, mm: &MemoryManager, directory: &mut PageDirectory) -> Result<(), VmError> {
        for page_index in 0..self.page_count() {
            self.map_individual_page(mm, directory, page_index)?;
        }
        self.mapped = true;
        Ok(())
    }

    /// Resolve a fault at an address inside this region.
    ///
    /// Other regions mapping the same VMObject are not touched; use
    /// [`AddressSpace::handle_fault`](super::address_space::AddressSpace::handle_fault),
    /// which refreshes them when a slot's page was replaced.
    pub fn handle_fault(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        fault: &PageFault,
    ) -> PageFaultResponse {
        self.resolve_fault(mm, directory, fault).0
    }

    /// [`handle_fault`](Self::handle_fault), also returning the VMObject
    /// slot whose page was swapped for a new frame. Every other mapper of
    /// that slot still translates to the old frame until refreshed.
    pub(crate) fn resolve_fault(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        fault: &PageFault,
    ) -> (PageFaultResponse, Option<usize>) {
        let response = |response| (response, None);
        let page_index = self.page_index_of(fault.vaddr());

        if fault.mode() == ExecutionMode::User && !self.is_user_accessible() {
            debug!("[PAGEFAULT] user access to kernel region {}", self.name);
            return response(PageFaultResponse::ShouldCrash);
        }
        if fault.is_instruction_fetch() && !self.is_executable() {
            debug!("[PAGEFAULT] execute in non-executable region {}", self.name);
            return response(PageFaultResponse::ShouldCrash);
        }
        if fault.is_write() && !self.is_writable() {
            debug!("[PAGEFAULT] write to read-only region {}", self.name);
            return response(PageFaultResponse::ShouldCrash);
        }
        if fault.is_read() && !self.is_readable() {
            debug!("[PAGEFAULT] read from unreadable region {}", self.name);
            return response(PageFaultResponse::ShouldCrash);
        }

        let resident = self.physical_page(page_index);
        if fault.is_write() {
            let needs_copy = resident
                .as_ref()
                .is_some_and(|page| page.is_shared_zero_page() || self.should_cow(page_index));
            if needs_copy {
                drop(resident);
                return self.handle_cow_fault(mm, directory, page_index);
            }
        }

        match resident {
            None if self.vmobject.is_inode() => {
                response(self.handle_inode_fault(mm, directory, page_index))
            }
            None => response(self.handle_zero_fault(mm, directory, page_index, fault)),
            Some(page) if fault.is_not_present() => {
                // Filled through another mapping of the same object.
                drop(page);
                response(self.finish_mapping(mm, directory, page_index))
            }
            Some(page) => {
                debug!(
                    "[PAGEFAULT] {:?} at {} on resident {:?} in {}",
                    fault.kind(),
                    fault.vaddr(),
                    page,
                    self.name
                );
                response(PageFaultResponse::ShouldCrash)
            }
        }
    }

    fn finish_mapping(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        page_index: usize,
    ) -> PageFaultResponse {
        match self.map_individual_page(mm, directory, page_index) {
            Ok(()) => PageFaultResponse::Continue,
            Err(err) => {
                warn!("[PAGEFAULT] could not map page {} of {}: {}", page_index, self.name, err);
                PageFaultResponse::OutOfMemory
            }
        }
    }

    fn handle_cow_fault(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        page_index: usize,
    ) -> (PageFaultResponse, Option<usize>) {
        let vmobject_page = self.translate_to_vmobject_page(page_index);
        let result = self.vmobject.with_physical_page_slot(vmobject_page, |slot| {
            let Some(page) = slot.as_ref() else {
                return Err(PageFaultResponse::ShouldCrash);
            };
            if page.is_shared_zero_page() {
                let fresh = mm
                    .allocator()
                    .allocate_user_page(ShouldZeroFill::Yes)
                    .ok_or(PageFaultResponse::OutOfMemory)?;
                trace!("[PAGEFAULT] zero page replaced by {}", fresh.paddr());
                *slot = Some(fresh);
                Ok(true)
            } else if page.ref_count() == 1 {
                trace!("[PAGEFAULT] sole owner of {}, no copy", page.paddr());
                Ok(false)
            } else {
                let fresh = mm
                    .allocator()
                    .allocate_user_page(ShouldZeroFill::No)
                    .ok_or(PageFaultResponse::OutOfMemory)?;
                mm.copy_physical_page(page, &fresh);
                trace!("[PAGEFAULT] copied {} to {}", page.paddr(), fresh.paddr());
                *slot = Some(fresh);
                Ok(true)
            }
        });
        let replaced = match result {
            Ok(replaced) => replaced,
            Err(response) => {
                if response == PageFaultResponse::OutOfMemory {
                    warn!("[PAGEFAULT] out of memory during copy-on-write in {}", self.name);
                }
                return (response, None);
            }
        };

        self.set_should_cow(page_index, false);
        mm.stats().record_cow();
        let response = self.finish_mapping(mm, directory, page_index);
        (response, replaced.then_some(vmobject_page))
    }

    fn handle_zero_fault(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        page_index: usize,
        fault: &PageFault,
    ) -> PageFaultResponse {
        let vmobject_page = self.translate_to_vmobject_page(page_index);
        // Shared mappings never hold the zero page.
        let read_only = !fault.is_write() && !self.is_shared();
        match self
            .vmobject
            .populate(vmobject_page, read_only, mm.allocator(), mm.quickmap())
        {
            Ok(_) => {
                mm.stats().record_zero_fill();
                self.finish_mapping(mm, directory, page_index)
            }
            Err(PopulateError::OutOfMemory) => {
                warn!("[PAGEFAULT] out of memory for zero fill in {}", self.name);
                PageFaultResponse::OutOfMemory
            }
            Err(PopulateError::Io(_)) => PageFaultResponse::BusError,
        }
    }

    fn handle_inode_fault(
        &mut self,
        mm: &MemoryManager,
        directory: &mut PageDirectory,
        page_index: usize,
    ) -> PageFaultResponse {
        let vmobject_page = self.translate_to_vmobject_page(page_index);
        match self
            .vmobject
            .populate(vmobject_page, false, mm.allocator(), mm.quickmap())
        {
            Ok(_) => {
                mm.stats().record_inode_fault();
                if self.vmobject.requires_cow_before_write() && self.is_writable() {
                    self.set_should_cow(page_index, true);
                }
                self.finish_mapping(mm, directory, page_index)
            }
            Err(PopulateError::OutOfMemory) => {
                warn!("[PAGEFAULT] out of memory paging in {}", self.name);
                PageFaultResponse::OutOfMemory
            }
            Err(PopulateError::Io(err)) => {
                warn!("[PAGEFAULT] I/O error paging in {}: {}", self.name, err);
                PageFaultResponse::BusError
            }
        }
    }

    /// Duplicate this region into the address space `child` for fork.
    ///
    /// Shared mappings (and shared inode or contiguous objects) keep the
    /// same VMObject. Private mappings get a shallow copy of it, and every
    /// resident page is marked copy-on-write on both sides; the parent is
    /// remapped read-only before this returns.
    pub fn clone_for_fork(
        &mut self,
        mm: &MemoryManager,
        parent: &mut PageDirectory,
        child: AddressSpaceId,
    ) -> Result<Region, VmError> {
        let private = !self.is_shared()
            && (self.vmobject.is_anonymous() || self.vmobject.is_private_inode());
        let vmobject = if private {
            self.vmobject.clone_for_fork()
        } else {
            self.vmobject.clone()
        };

        let mut clone = Region::new(
            &self.registry,
            child,
            self.range,
            vmobject,
            self.offset_in_vmobject,
            &self.name,
            self.access,
            self.flags,
        );
        clone.cow_map = self.cow_map.clone();

        if private {
            let mut marked = 0;
            for page_index in 0..self.page_count() {
                if self.physical_page(page_index).is_some() {
                    self.set_should_cow(page_index, true);
                    clone.set_should_cow(page_index, true);
                    marked += 1;
                }
            }
            if marked > 0 && self.is_writable() {
                self.remap(mm, parent)?;
            }
            debug!("[MM] fork {}: {} page(s) now copy-on-write", self.name, marked);
        }
        Ok(clone)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("range", &self.range)
            .field("access", &self.access)
            .field("flags", &self.flags)
            .field("vmobject", &self.vmobject.id())
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.registry.unregister_region(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{AccessKind, FaultKind};
    use crate::mm::page_directory::DirectoryKind;
    use crate::testing::Machine;

    const BASE: usize = 0x20_0000;

    fn region(
        machine: &Machine,
        vmobject: Arc<VmObject>,
        access: Access,
        flags: RegionFlags,
    ) -> Region {
        let registry = machine.mm.registry();
        let range = VirtualRange::new(VirtAddr::new(BASE), vmobject.size()).unwrap();
        Region::new(registry, registry.next_space_id(), range, vmobject, 0, "test", access, flags)
    }

    fn fault(page: usize, kind: FaultKind, access: AccessKind) -> PageFault {
        PageFault::new(VirtAddr::new(BASE + page * PAGE_SIZE), kind, access, ExecutionMode::User)
    }

    #[test]
    fn test_cow_bitmap_is_allocated_on_first_mark() {
        let machine = Machine::boot(16, 1);
        let object = machine.mm.allocate_anonymous_vmobject(4);
        let mut region = region(&machine, object, Access::READ_WRITE, RegionFlags::USER);
        region.set_should_cow(2, false);
        assert!(!region.has_cow_map());
        region.set_should_cow(2, true);
        assert!(region.has_cow_map());
        assert!(region.should_cow(2));
        assert!(!region.should_cow(1));
        region.set_should_cow(2, false);
        assert!(!region.should_cow(2));
    }

    #[test]
    fn test_unmapping_twice_frees_nothing_twice() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous_committed(mm.registry(), mm.allocator(), 2).unwrap();
        let mut directory = PageDirectory::new(mm.allocator(), DirectoryKind::User).unwrap();
        let mut region = region(&machine, object, Access::READ_WRITE, RegionFlags::USER);

        region.map(mm, &mut directory).unwrap();
        assert!(region.is_mapped());
        assert!(directory.translate(VirtAddr::new(BASE + PAGE_SIZE)).is_some());
        let used = mm.system_memory_info().user_physical_pages_used;

        region.unmap(mm, &mut directory);
        region.unmap(mm, &mut directory);
        assert!(!region.is_mapped());
        assert!(directory.translate(VirtAddr::new(BASE)).is_none());
        assert_eq!(mm.system_memory_info().user_physical_pages_used, used);
        assert_eq!(region.amount_resident(), 2);
    }

    #[test]
    fn test_sole_owner_write_needs_no_copy() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous_committed(mm.registry(), mm.allocator(), 1).unwrap();
        let mut directory = PageDirectory::new(mm.allocator(), DirectoryKind::User).unwrap();
        let mut region = region(&machine, object, Access::READ_WRITE, RegionFlags::USER);
        region.set_should_cow(0, true);
        region.map(mm, &mut directory).unwrap();
        let before = directory.entry(VirtAddr::new(BASE)).unwrap();
        assert!(!before.is_writable());
        let used = mm.system_memory_info().user_physical_pages_used;

        let response = region.handle_fault(
            mm,
            &mut directory,
            &fault(0, FaultKind::ProtectionViolation, AccessKind::Write),
        );
        assert_eq!(response, PageFaultResponse::Continue);
        let after = directory.entry(VirtAddr::new(BASE)).unwrap();
        assert!(after.is_writable());
        assert_eq!(after.addr(), before.addr());
        assert!(!region.should_cow(0));
        assert_eq!(mm.system_memory_info().user_physical_pages_used, used);
    }

    #[test]
    fn test_permission_checks_come_first() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let mut directory = PageDirectory::new(mm.allocator(), DirectoryKind::User).unwrap();
        let object = mm.allocate_anonymous_vmobject(1);
        let mut kernel_only = region(&machine, object.clone(), Access::READ_WRITE, RegionFlags::CACHEABLE);
        assert_eq!(
            kernel_only.handle_fault(mm, &mut directory, &fault(0, FaultKind::PageNotPresent, AccessKind::Read)),
            PageFaultResponse::ShouldCrash
        );
        drop(kernel_only);

        let mut write_only = region(&machine, object, Access::WRITE, RegionFlags::USER);
        assert_eq!(
            write_only.handle_fault(mm, &mut directory, &fault(0, FaultKind::PageNotPresent, AccessKind::Read)),
            PageFaultResponse::ShouldCrash
        );
        assert_eq!(write_only.amount_resident(), 0);
    }

    #[test]
    fn test_protection_fault_on_a_resident_page_crashes() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous_committed(mm.registry(), mm.allocator(), 1).unwrap();
        let mut directory = PageDirectory::new(mm.allocator(), DirectoryKind::User).unwrap();
        let mut region = region(&machine, object, Access::READ, RegionFlags::USER);
        region.map(mm, &mut directory).unwrap();
        assert_eq!(
            region.handle_fault(mm, &mut directory, &fault(0, FaultKind::ProtectionViolation, AccessKind::Read)),
            PageFaultResponse::ShouldCrash
        );
    }

    #[test]
    fn test_fork_clone_marks_resident_pages_on_both_sides() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = mm.allocate_anonymous_vmobject(3);
        let mut directory = PageDirectory::new(mm.allocator(), DirectoryKind::User).unwrap();
        let mut parent = region(&machine, object, Access::READ_WRITE, RegionFlags::USER);
        parent.handle_fault(mm, &mut directory, &fault(1, FaultKind::PageNotPresent, AccessKind::Write));
        assert!(directory.entry(VirtAddr::new(BASE + PAGE_SIZE)).unwrap().is_writable());

        let child_space = mm.registry().next_space_id();
        let child = parent.clone_for_fork(mm, &mut directory, child_space).unwrap();
        assert_ne!(child.vmobject().id(), parent.vmobject().id());
        assert_eq!(child.space(), child_space);
        assert!(parent.should_cow(1) && child.should_cow(1));
        assert!(!parent.should_cow(0) && !child.should_cow(0));
        assert!(!directory.entry(VirtAddr::new(BASE + PAGE_SIZE)).unwrap().is_writable());
        assert_eq!(parent.amount_shared(), 1);
    }

    #[test]
    fn test_shared_regions_fork_onto_the_same_object() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous_committed(mm.registry(), mm.allocator(), 1).unwrap();
        let mut directory = PageDirectory::new(mm.allocator(), DirectoryKind::User).unwrap();
        let mut parent = region(
            &machine,
            object,
            Access::READ_WRITE,
            RegionFlags::USER | RegionFlags::SHARED,
        );
        parent.map(mm, &mut directory).unwrap();
        let child = parent
            .clone_for_fork(mm, &mut directory, mm.registry().next_space_id())
            .unwrap();
        assert_eq!(child.vmobject().id(), parent.vmobject().id());
        assert!(!parent.has_cow_map());
        assert!(directory.entry(VirtAddr::new(BASE)).unwrap().is_writable());
    }

    #[test]
    #[should_panic(expected = "overruns")]
    fn test_region_past_the_object_end_panics() {
        let machine = Machine::boot(16, 1);
        let registry = machine.mm.registry();
        let object = machine.mm.allocate_anonymous_vmobject(1);
        let range = VirtualRange::new(VirtAddr::new(BASE), 2 * PAGE_SIZE).unwrap();
        Region::new(
            registry,
            registry.next_space_id(),
            range,
            object,
            0,
            "too big",
            Access::READ,
            RegionFlags::USER,
        );
    }
}
