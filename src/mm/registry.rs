//! Registries of every live VMObject, Region and AddressSpace.
//!
//! Entries are handles, never owners: VMObjects and address spaces are held
//! as `Weak`, regions by id plus the handles needed to find them again.
//! Registration happens at construction and removal in `Drop`.
//!
//! Nothing may drop an `Arc` of a registered object while the registry lock
//! is held, since its `Drop` takes the same lock.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::address::VirtualRange;
use super::address_space::AddressSpace;
use super::inode::InodeId;
use super::vmobject::VmObject;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// Stable handle of a VMObject.
    VmObjectId,
    "vmobject"
);
handle!(
    /// Stable handle of a Region.
    RegionId,
    "region"
);
handle!(
    /// Stable handle of an AddressSpace.
    AddressSpaceId,
    "space"
);

/// Where a registered region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRecord {
    pub space: AddressSpaceId,
    pub vmobject: VmObjectId,
    pub range: VirtualRange,
}

#[derive(Default)]
struct Tables {
    vmobjects: BTreeMap<VmObjectId, Weak<VmObject>>,
    regions: BTreeMap<RegionId, RegionRecord>,
    spaces: BTreeMap<AddressSpaceId, Weak<AddressSpace>>,
    shared_inodes: BTreeMap<InodeId, Weak<VmObject>>,
}

/// The global index sets.
pub struct Registry {
    next_id: AtomicU64,
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_vmobject_id(&self) -> VmObjectId {
        VmObjectId(self.next())
    }

    pub fn next_region_id(&self) -> RegionId {
        RegionId(self.next())
    }

    pub fn next_space_id(&self) -> AddressSpaceId {
        AddressSpaceId(self.next())
    }

    pub fn register_vmobject(&self, vmobject: &Arc<VmObject>) {
        let previous = self
            .tables
            .lock()
            .vmobjects
            .insert(vmobject.id(), Arc::downgrade(vmobject));
        assert!(previous.is_none(), "{:?} registered twice", vmobject.id());
    }

    pub fn unregister_vmobject(&self, id: VmObjectId) {
        let mut tables = self.tables.lock();
        tables.vmobjects.remove(&id);
        tables.shared_inodes.retain(|_, object| object.strong_count() > 0);
    }

    pub fn register_region(&self, id: RegionId, record: RegionRecord) {
        let previous = self.tables.lock().regions.insert(id, record);
        assert!(previous.is_none(), "{:?} registered twice", id);
    }

    pub fn unregister_region(&self, id: RegionId) {
        self.tables.lock().regions.remove(&id);
    }

    pub fn register_space(&self, space: &Arc<AddressSpace>) {
        self.tables
            .lock()
            .spaces
            .insert(space.id(), Arc::downgrade(space));
    }

    pub fn unregister_space(&self, id: AddressSpaceId) {
        self.tables.lock().spaces.remove(&id);
    }

    /// The address space behind `id`, if it is still alive.
    pub fn space(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        self.tables.lock().spaces.get(&id).and_then(Weak::upgrade)
    }

    /// Every region currently mapping `vmobject`.
    pub fn regions_of(&self, vmobject: VmObjectId) -> Vec<(RegionId, RegionRecord)> {
        self.tables
            .lock()
            .regions
            .iter()
            .filter(|(_, record)| record.vmobject == vmobject)
            .map(|(id, record)| (*id, *record))
            .collect()
    }

    /// Strong handles to every live VMObject.
    pub fn vmobjects(&self) -> Vec<Arc<VmObject>> {
        self.tables
            .lock()
            .vmobjects
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn vmobject_count(&self) -> usize {
        self.tables.lock().vmobjects.len()
    }

    pub fn region_count(&self) -> usize {
        self.tables.lock().regions.len()
    }

    pub fn space_count(&self) -> usize {
        self.tables.lock().spaces.len()
    }

    /// The shared VMObject of an inode, built with `create` if none is alive.
    ///
    /// When two callers race, the loser's object is dropped and both get the
    /// winner's.
    pub fn shared_inode_vmobject(
        &self,
        inode: InodeId,
        create: impl FnOnce() -> Arc<VmObject>,
    ) -> Arc<VmObject> {
        if let Some(existing) = self.lookup_shared_inode(inode) {
            return existing;
        }
        let created = create();
        let winner = {
            let mut tables = self.tables.lock();
            match tables.shared_inodes.get(&inode).and_then(Weak::upgrade) {
                Some(existing) => Some(existing),
                None => {
                    tables.shared_inodes.insert(inode, Arc::downgrade(&created));
                    None
                }
            }
        };
        winner.unwrap_or(created)
    }

    /// The live shared VMObject of `inode`, if any.
    pub fn lookup_shared_inode(&self, inode: InodeId) -> Option<Arc<VmObject>> {
        self.tables
            .lock()
            .shared_inodes
            .get(&inode)
            .and_then(Weak::upgrade)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
