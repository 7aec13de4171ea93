//! VM Objects
//!
//! A VMObject is the content behind one or more regions: an array of
//! physical-page slots, one per page, filled lazily on first fault.
//!
//! # Variants
//! - Anonymous: absent slots become zero-filled pages
//! - InodeShared: absent slots are read from the inode; one object per
//!   inode is shared by every mapper, so writes are visible to all
//! - InodePrivate: read from the inode, but written pages are copied first
//! - Contiguous: every slot filled at creation from one physical run
//!
//! # Invariants
//! - The slot count never changes
//! - A populated slot is never reset to absent, and never overwritten by a
//!   second populator; copy-on-write is the only replacement

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, trace, warn};
use spin::Mutex;

use super::address::{page_round_up, PAGE_SHIFT, PAGE_SIZE};
use super::error::VmError;
use super::frame::{PhysicalPage, PhysicalPageAllocator, ShouldZeroFill};
use super::inode::{Inode, InodeError};
use super::page_directory::PageDirectory;
use super::quickmap::QuickMap;
use super::region::Region;
use super::registry::{Registry, VmObjectId};

/// What backs a VMObject, and so how its absent slots are filled.
#[derive(Clone)]
pub enum VmObjectKind {
    Anonymous,
    InodeShared(Arc<dyn Inode>),
    InodePrivate(Arc<dyn Inode>),
    Contiguous,
}

impl fmt::Debug for VmObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::InodeShared(inode) => write!(f, "InodeShared({:?})", inode.id()),
            Self::InodePrivate(inode) => write!(f, "InodePrivate({:?})", inode.id()),
            Self::Contiguous => write!(f, "Contiguous"),
        }
    }
}

/// Why an absent slot could not be filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateError {
    OutOfMemory,
    Io(InodeError),
}

/// The content of a logical memory object.
pub struct VmObject {
    id: VmObjectId,
    kind: VmObjectKind,
    slots: Mutex<Vec<Option<PhysicalPage>>>,
    registry: Arc<Registry>,
}

impl VmObject {
    fn create(
        registry: &Arc<Registry>,
        kind: VmObjectKind,
        slots: Vec<Option<PhysicalPage>>,
    ) -> Arc<Self> {
        let object = Arc::new(Self {
            id: registry.next_vmobject_id(),
            kind,
            slots: Mutex::new(slots),
            registry: registry.clone(),
        });
        registry.register_vmobject(&object);
        debug!(
            "[MM] created {:?} {:?} ({} pages)",
            object.id,
            object.kind,
            object.page_count()
        );
        object
    }

    /// Lazily populated anonymous memory.
    pub fn anonymous(registry: &Arc<Registry>, page_count: usize) -> Arc<Self> {
        Self::create(registry, VmObjectKind::Anonymous, vec![None; page_count])
    }

    /// Anonymous memory with every page allocated and zeroed up front.
    pub fn anonymous_committed(
        registry: &Arc<Registry>,
        allocator: &PhysicalPageAllocator,
        page_count: usize,
    ) -> Result<Arc<Self>, VmError> {
        let slots = (0..page_count)
            .map(|_| {
                allocator
                    .allocate_user_page(ShouldZeroFill::Yes)
                    .map(Some)
                    .ok_or(VmError::OutOfMemory)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::create(registry, VmObjectKind::Anonymous, slots))
    }

    /// A view of `inode`, sized to cover the whole file.
    pub fn from_inode(registry: &Arc<Registry>, inode: Arc<dyn Inode>, shared: bool) -> Arc<Self> {
        let page_count = page_round_up(inode.size()).unwrap_or(usize::MAX) >> PAGE_SHIFT;
        let kind = if shared {
            VmObjectKind::InodeShared(inode)
        } else {
            VmObjectKind::InodePrivate(inode)
        };
        Self::create(registry, kind, vec![None; page_count])
    }

    /// A physically contiguous, fully populated object for DMA.
    pub fn contiguous(
        registry: &Arc<Registry>,
        allocator: &PhysicalPageAllocator,
        page_count: usize,
    ) -> Result<Arc<Self>, VmError> {
        let pages = allocator.allocate_contiguous_supervisor_pages(page_count)?;
        let slots = pages.into_iter().map(Some).collect();
        Ok(Self::create(registry, VmObjectKind::Contiguous, slots))
    }

    /// A private copy of the slot array for a forked mapping.
    ///
    /// The new object references the same physical pages; the regions on
    /// both sides mark them copy-on-write.
    pub fn clone_for_fork(&self) -> Arc<Self> {
        let slots = self.slots.lock().clone();
        Self::create(&self.registry, self.kind.clone(), slots)
    }

    #[inline]
    pub fn id(&self) -> VmObjectId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> &VmObjectKind {
        &self.kind
    }

    pub fn page_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn size(&self) -> usize {
        self.page_count() * PAGE_SIZE
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, VmObjectKind::Anonymous)
    }

    pub fn is_inode(&self) -> bool {
        self.inode().is_some()
    }

    pub fn is_shared_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::InodeShared(_))
    }

    pub fn is_private_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::InodePrivate(_))
    }

    pub fn is_contiguous(&self) -> bool {
        matches!(self.kind, VmObjectKind::Contiguous)
    }

    /// Whether freshly populated pages must be mapped read-only so the first
    /// write goes through copy-on-write.
    pub fn requires_cow_before_write(&self) -> bool {
        self.is_private_inode()
    }

    pub fn inode(&self) -> Option<&Arc<dyn Inode>> {
        match &self.kind {
            VmObjectKind::InodeShared(inode) | VmObjectKind::InodePrivate(inode) => Some(inode),
            VmObjectKind::Anonymous | VmObjectKind::Contiguous => None,
        }
    }

    /// A new reference to the page in slot `index`, if resident.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn physical_page(&self, index: usize) -> Option<PhysicalPage> {
        self.slots.lock()[index].clone()
    }

    /// Run `f` with exclusive access to slot `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn with_physical_page_slot<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut Option<PhysicalPage>) -> R,
    ) -> R {
        let mut slots = self.slots.lock();
        let count = slots.len();
        match slots.get_mut(index) {
            Some(slot) => f(slot),
            None => panic!("{:?}: slot {} out of range ({} slots)", self.id, index, count),
        }
    }

    /// Pages backed by real frames. The shared zero page does not count.
    pub fn amount_resident(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|page| !page.is_shared_zero_page())
            .count()
    }

    /// Resident pages referenced from more than one place.
    pub fn amount_shared(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|page| !page.is_shared_zero_page() && page.ref_count() > 1)
            .count()
    }

    /// Fill an absent slot, or return what is already there.
    ///
    /// Anonymous slots take the shared zero page when `read_only` is set
    /// and a private zeroed page otherwise. Inode slots are read without
    /// holding the slot lock; if another CPU filled the slot meanwhile, the
    /// page read here is discarded.
    ///
    /// # Panics
    /// Panics if a contiguous object has an absent slot.
    pub fn populate(
        &self,
        index: usize,
        read_only: bool,
        allocator: &PhysicalPageAllocator,
        quickmap: &QuickMap,
    ) -> Result<PhysicalPage, PopulateError> {
        match &self.kind {
            VmObjectKind::Anonymous => self.with_physical_page_slot(index, |slot| {
                if let Some(page) = slot {
                    return Ok(page.clone());
                }
                let page = if read_only {
                    allocator.shared_zero_page()
                } else {
                    allocator
                        .allocate_user_page(ShouldZeroFill::Yes)
                        .ok_or(PopulateError::OutOfMemory)?
                };
                trace!("[MM] {:?} slot {} <- {:?}", self.id, index, page);
                *slot = Some(page.clone());
                Ok(page)
            }),
            VmObjectKind::InodeShared(inode) | VmObjectKind::InodePrivate(inode) => {
                if let Some(page) = self.physical_page(index) {
                    return Ok(page);
                }
                let page = self.read_inode_page(inode.as_ref(), index, allocator, quickmap)?;
                self.with_physical_page_slot(index, |slot| match slot {
                    Some(existing) => {
                        debug!(
                            "[MM] {:?} slot {} filled concurrently, dropping our read",
                            self.id, index
                        );
                        Ok(existing.clone())
                    }
                    None => {
                        *slot = Some(page.clone());
                        Ok(page)
                    }
                })
            }
            VmObjectKind::Contiguous => match self.physical_page(index) {
                Some(page) => Ok(page),
                None => panic!("{:?}: contiguous slot {} is empty", self.id, index),
            },
        }
    }

    fn read_inode_page(
        &self,
        inode: &dyn Inode,
        index: usize,
        allocator: &PhysicalPageAllocator,
        quickmap: &QuickMap,
    ) -> Result<PhysicalPage, PopulateError> {
        let bytes = inode.read_page(index).map_err(|err| {
            warn!("[MM] {:?} read of page {} failed: {}", inode.id(), index, err);
            PopulateError::Io(err)
        })?;
        let page = allocator
            .allocate_user_page(ShouldZeroFill::No)
            .ok_or(PopulateError::OutOfMemory)?;
        let mut frame = quickmap.map(page.paddr());
        let frame = frame.as_mut_slice();
        let len = bytes.len().min(PAGE_SIZE);
        frame[..len].copy_from_slice(&bytes[..len]);
        frame[len..].fill(0);
        trace!("[MM] paged in {:?} page {} ({} bytes)", inode.id(), index, len);
        Ok(page)
    }

    /// Write every resident page of a shared inode object back to its
    /// inode, copying each frame out with `read`. Other kinds write nothing.
    /// Returns the number of pages written.
    pub fn write_back(
        &self,
        mut read: impl FnMut(&PhysicalPage, &mut [u8; PAGE_SIZE]),
    ) -> Result<usize, InodeError> {
        let VmObjectKind::InodeShared(inode) = &self.kind else {
            return Ok(0);
        };
        let size = inode.size();
        let mut bounce = [0u8; PAGE_SIZE];
        let mut written = 0;
        for index in 0..self.page_count() {
            let start = index * PAGE_SIZE;
            if start >= size {
                break;
            }
            let Some(page) = self.physical_page(index) else {
                continue;
            };
            if page.is_shared_zero_page() {
                continue;
            }
            read(&page, &mut bounce);
            let len = PAGE_SIZE.min(size - start);
            inode.write_back(index, &bounce[..len])?;
            written += 1;
        }
        debug!("[MM] wrote back {} page(s) of {:?}", written, inode.id());
        Ok(written)
    }

    /// Call `f` for every region mapping this object, in every address space.
    ///
    /// Takes each address space's lock in turn; the caller must not hold any.
    pub fn for_each_region(&self, mut f: impl FnMut(&mut Region, &mut PageDirectory)) {
        for (region, record) in self.registry.regions_of(self.id) {
            let Some(space) = self.registry.space(record.space) else {
                continue;
            };
            space.with_region(region, |r, directory| f(r, directory));
        }
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pages", &self.page_count())
            .finish()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        self.registry.unregister_vmobject(self.id);
        trace!("[MM] destroyed {:?}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::PoolKind;
    use crate::testing::{Machine, MemoryInode};
    use alloc::boxed::Box;
    use core::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_slots_start_absent_and_fill_once() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous(mm.registry(), 3);
        assert_eq!(object.page_count(), 3);
        assert_eq!(object.size(), 3 * PAGE_SIZE);
        assert!((0..3).all(|i| object.physical_page(i).is_none()));

        let first = object.populate(1, false, mm.allocator(), mm.quickmap()).unwrap();
        let again = object.populate(1, false, mm.allocator(), mm.quickmap()).unwrap();
        assert!(first.ptr_eq(&again));
        assert_eq!(object.amount_resident(), 1);
        assert_eq!(mm.allocator().info().user_physical_pages_used, 1);
    }

    #[test]
    fn test_read_only_population_uses_the_zero_page() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous(mm.registry(), 1);
        let page = object.populate(0, true, mm.allocator(), mm.quickmap()).unwrap();
        assert!(page.is_shared_zero_page());
        assert_eq!(object.amount_resident(), 0);
        assert_eq!(mm.allocator().info().user_physical_pages_used, 0);
    }

    #[test]
    fn test_inode_population_reads_and_pads_short_pages() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let inode = MemoryInode::new(4, alloc::vec![0xee; PAGE_SIZE + 10]);
        let object = VmObject::from_inode(mm.registry(), inode.clone(), false);
        assert_eq!(object.page_count(), 2);
        assert!(object.is_private_inode());
        assert!(object.requires_cow_before_write());

        let page = object.populate(1, false, mm.allocator(), mm.quickmap()).unwrap();
        let bytes = machine.frame_bytes(page.paddr());
        assert!(bytes[..10].iter().all(|&b| b == 0xee));
        assert!(bytes[10..].iter().all(|&b| b == 0));

        object.populate(1, true, mm.allocator(), mm.quickmap()).unwrap();
        assert_eq!(inode.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_inode_read_leaves_the_slot_absent() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let inode = MemoryInode::patterned(9, 1);
        inode.fail_reads.store(true, Ordering::Relaxed);
        let object = VmObject::from_inode(mm.registry(), inode, true);
        assert_eq!(
            object.populate(0, false, mm.allocator(), mm.quickmap()).err(),
            Some(PopulateError::Io(InodeError::Io))
        );
        assert!(object.physical_page(0).is_none());
        assert_eq!(mm.allocator().info().user_physical_pages_used, 0);
    }

    #[test]
    fn test_concurrent_inode_fill_keeps_the_first_page() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let inode = MemoryInode::patterned(10, 1);
        let object = VmObject::from_inode(mm.registry(), inode.clone(), true);
        let first = mm.allocator().allocate_user_page(ShouldZeroFill::Yes).unwrap();
        let used = mm.allocator().info().user_physical_pages_used;

        let (target, installed) = (object.clone(), first.clone());
        *inode.on_read.lock() = Some(Box::new(move || {
            target.with_physical_page_slot(0, |slot| *slot = Some(installed))
        }));
        let page = object.populate(0, false, mm.allocator(), mm.quickmap()).unwrap();

        assert!(page.ptr_eq(&first));
        assert!(object.physical_page(0).is_some_and(|resident| resident.ptr_eq(&first)));
        assert_eq!(inode.reads.load(Ordering::Relaxed), 1);
        assert_eq!(mm.allocator().info().user_physical_pages_used, used);
        assert!(machine.frame_bytes(first.paddr()).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_contiguous_objects_are_fully_resident() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let free = mm.allocator().free_pages(PoolKind::Supervisor);
        let object = VmObject::contiguous(mm.registry(), mm.allocator(), 3).unwrap();
        assert_eq!(object.amount_resident(), 3);
        assert_eq!(mm.allocator().free_pages(PoolKind::Supervisor), free - 3);
        let page = object.populate(2, false, mm.allocator(), mm.quickmap()).unwrap();
        assert_eq!(
            page.paddr().as_usize(),
            object.physical_page(0).unwrap().paddr().as_usize() + 2 * PAGE_SIZE
        );
    }

    #[test]
    fn test_fork_clone_shares_frames_until_dropped() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let object = VmObject::anonymous_committed(mm.registry(), mm.allocator(), 2).unwrap();
        let clone = object.clone_for_fork();
        assert_ne!(clone.id(), object.id());
        assert_eq!(object.amount_shared(), 2);
        assert!(object
            .physical_page(0)
            .unwrap()
            .ptr_eq(&clone.physical_page(0).unwrap()));

        drop(clone);
        assert_eq!(object.amount_shared(), 0);
        assert_eq!(mm.allocator().info().user_physical_pages_used, 2);
        drop(object);
        assert_eq!(mm.allocator().info().user_physical_pages_used, 0);
        assert_eq!(mm.registry().vmobject_count(), 0);
    }

    #[test]
    fn test_one_shared_object_per_inode() {
        let machine = Machine::boot(16, 1);
        let mm = &machine.mm;
        let inode = MemoryInode::patterned(12, 1);
        let a = mm.shared_inode_vmobject(inode.clone());
        let b = mm.shared_inode_vmobject(inode.clone());
        assert_eq!(a.id(), b.id());
        let private = mm.private_inode_vmobject(inode.clone());
        assert_ne!(private.id(), a.id());

        drop((a, b));
        let c = mm.shared_inode_vmobject(inode);
        assert!(c.is_shared_inode());
        assert_eq!(mm.registry().vmobject_count(), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_slot_access_past_the_end_panics() {
        let machine = Machine::boot(16, 1);
        let object = VmObject::anonymous(machine.mm.registry(), 1);
        object.with_physical_page_slot(1, |_| ());
    }
}
