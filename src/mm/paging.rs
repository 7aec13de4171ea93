//! Translation table descriptors
//!
//! VMSAv8-64 with a 4 KiB granule: four levels of 512 descriptors, L0 entries
//! spanning 512 GiB down to 4 KiB pages at L3. Block descriptors are never
//! written; every leaf is an L3 page.

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysAddr, ENTRIES_PER_TABLE};

bitflags! {
    /// Descriptor attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Descriptor is valid.
        const VALID = 1 << 0;
        /// Table descriptor at L0-L2, page descriptor at L3.
        const TABLE = 1 << 1;
        /// MAIR index 1: Device memory.
        const ATTR_DEVICE = 1 << 2;
        /// MAIR index 2: Normal non-cacheable.
        const ATTR_NC = 2 << 2;
        /// AP[1]: accessible from EL0.
        const AP_USER = 1 << 6;
        /// AP[2]: read-only at every level.
        const AP_READ_ONLY = 1 << 7;
        /// Inner shareable.
        const SH_INNER = 0b11 << 8;
        /// Access Flag - set so the first access does not trap.
        const AF = 1 << 10;
        /// Not Global - tagged with the ASID.
        const NG = 1 << 11;
        /// Privileged Execute Never.
        const PXN = 1 << 53;
        /// User Execute Never.
        const UXN = 1 << 54;
    }
}

impl PageFlags {
    /// Valid L3 page descriptor type bits.
    pub const PAGE: Self = Self::VALID.union(Self::TABLE);

    /// Descriptor for an intermediate table.
    pub const TABLE_ENTRY: Self = Self::VALID.union(Self::TABLE).union(Self::AF);

    /// Build a leaf descriptor's attributes from region-level properties.
    pub const fn leaf(writable: bool, executable: bool, user: bool, cacheable: bool) -> Self {
        let mut flags = Self::PAGE.union(Self::AF).union(Self::SH_INNER);
        if !cacheable {
            flags = flags.union(Self::ATTR_NC);
        }
        if user {
            // User pages are never executable by the kernel.
            flags = flags.union(Self::AP_USER).union(Self::NG).union(Self::PXN);
            if !executable {
                flags = flags.union(Self::UXN);
            }
        } else {
            flags = flags.union(Self::UXN);
            if !executable {
                flags = flags.union(Self::PXN);
            }
        }
        if !writable {
            flags = flags.union(Self::AP_READ_ONLY);
        }
        flags
    }

    /// Cacheable, writable, never executable, EL1 only.
    pub const KERNEL_DATA: Self = Self::leaf(true, false, false, true);
}

/// One 64-bit descriptor: a next-level table, an L3 page, or nothing.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Output address, bits [47:12].
    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn table(next_table_phys: PhysAddr) -> Self {
        debug_assert!(next_table_phys.is_aligned());
        Self((next_table_phys.as_u64() & Self::ADDR_MASK) | PageFlags::TABLE_ENTRY.bits())
    }

    /// Leaf descriptor for the frame at `phys`.
    #[inline]
    pub const fn page(phys: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(phys.is_aligned());
        Self((phys.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Check if this is a table (or, at L3, page) descriptor.
    #[inline]
    pub const fn is_table(self) -> bool {
        self.is_valid() && (self.0 & PageFlags::TABLE.bits() != 0)
    }

    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new((self.0 & Self::ADDR_MASK) as usize)
    }

    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        !self.flags().contains(PageFlags::AP_READ_ONLY)
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.flags().contains(PageFlags::AP_USER)
    }

    /// Whether the page may be executed from EL0 (`user`) or EL1.
    #[inline]
    pub const fn is_executable(self, user: bool) -> bool {
        if user {
            !self.flags().contains(PageFlags::UXN)
        } else {
            !self.flags().contains(PageFlags::PXN)
        }
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "Descriptor({} {:?})", self.addr(), self.flags())
        } else {
            f.write_str("Descriptor(invalid)")
        }
    }
}

/// One translation table, exactly one frame in size and alignment.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Valid descriptors with their indices.
    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
    }

    /// Whether no entry is valid.
    pub fn is_empty(&self) -> bool {
        self.iter_valid().next().is_none()
    }

    pub fn clear(&mut self) {
        self.entries.fill(PageTableEntry::invalid());
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_read_only_leaf() {
        let flags = PageFlags::leaf(false, false, true, true);
        let entry = PageTableEntry::page(PhysAddr::new(0x4020_0000), flags);
        assert!(entry.is_valid());
        assert!(entry.is_user());
        assert!(!entry.is_writable());
        assert!(!entry.is_executable(true));
        assert!(!entry.is_executable(false));
        assert_eq!(entry.addr(), PhysAddr::new(0x4020_0000));
    }

    #[test]
    fn test_kernel_data_is_not_user() {
        let entry = PageTableEntry::page(PhysAddr::new(0x4020_1000), PageFlags::KERNEL_DATA);
        assert!(!entry.is_user());
        assert!(entry.is_writable());
        assert!(!entry.is_executable(false));
    }

    #[test]
    fn test_uncached_leaf_selects_nc_attribute() {
        let flags = PageFlags::leaf(true, false, false, false);
        assert!(flags.contains(PageFlags::ATTR_NC));
    }

    #[test]
    fn test_table_entry_round_trips_address() {
        let entry = PageTableEntry::table(PhysAddr::new(0x4030_0000));
        assert!(entry.is_table());
        assert_eq!(entry.addr().as_usize(), 0x4030_0000);
    }
}
