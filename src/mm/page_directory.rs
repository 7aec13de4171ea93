//! Page Directory
//!
//! One 4-level translation tree, rooted at an L0 table. User directories are
//! loaded into TTBR0_EL1, the kernel directory into TTBR1_EL1.
//!
//! # Security Properties
//! - A user directory refuses kernel addresses and the kernel directory
//!   refuses user addresses
//! - Intermediate tables come from the supervisor pool and live exactly as
//!   long as the directory
//!
//! The directory never flushes the TLB itself; callers flush after the
//! change through [`flush_tlb`](crate::arch::flush_tlb).

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, trace};

use super::address::{PhysAddr, VirtAddr};
use super::error::VmError;
use super::frame::{PhysicalPage, PhysicalPageAllocator};
use super::paging::{PageFlags, PageTable, PageTableEntry};
use super::physical::PhysicalMemory;

/// Which half of the address space a directory translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    User,
    Kernel,
}

/// A hardware translation tree.
pub struct PageDirectory {
    kind: DirectoryKind,
    root: PhysicalPage,
    /// L1-L3 tables, kept alive for the directory's lifetime.
    tables: Vec<PhysicalPage>,
    memory: Arc<PhysicalMemory>,
}

impl PageDirectory {
    /// Create an empty directory with a zeroed L0 table.
    pub fn new(allocator: &PhysicalPageAllocator, kind: DirectoryKind) -> Result<Self, VmError> {
        let root = allocator.allocate_supervisor_page().ok_or(VmError::OutOfMemory)?;
        debug!("[MM] new {:?} page directory at {}", kind, root.paddr());
        Ok(Self {
            kind,
            root,
            tables: Vec::new(),
            memory: allocator.memory().clone(),
        })
    }

    #[inline]
    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// Physical address of the L0 table, the value for TTBRn_EL1.
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root.paddr()
    }

    /// Number of L1-L3 tables allocated so far.
    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn check_address(&self, vaddr: VirtAddr) -> Result<(), VmError> {
        if !vaddr.is_aligned() {
            return Err(VmError::MisalignedAddress);
        }
        let ok = match self.kind {
            DirectoryKind::User => vaddr.is_user(),
            DirectoryKind::Kernel => vaddr.is_kernel(),
        };
        if ok {
            Ok(())
        } else {
            Err(VmError::InvalidPermissions)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn table(&self, addr: PhysAddr) -> &mut PageTable {
        // SAFETY: `addr` is the root or one of `self.tables`, all page tables
        // owned by this directory; `&mut self` callers serialize access.
        unsafe { self.memory.table_mut(addr) }
    }

    /// Walk to the L3 table covering `vaddr`, creating missing levels.
    ///
    /// Returns the physical address of the L3 table.
    pub fn ensure_table(
        &mut self,
        allocator: &PhysicalPageAllocator,
        vaddr: VirtAddr,
    ) -> Result<PhysAddr, VmError> {
        let (l0, l1, l2, _) = vaddr.page_table_indices();
        let mut table = self.root.paddr();
        for index in [l0, l1, l2] {
            let entry = self.table(table)[index];
            table = if entry.is_table() {
                entry.addr()
            } else {
                let next = allocator.allocate_supervisor_page().ok_or(VmError::OutOfMemory)?;
                let addr = next.paddr();
                self.tables.push(next);
                self.table(table)[index] = PageTableEntry::table(addr);
                trace!("[MM] new page table {} for {}", addr, vaddr);
                addr
            };
        }
        Ok(table)
    }

    /// The L3 table covering `vaddr`, if every level exists.
    fn find_table(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let (l0, l1, l2, _) = vaddr.page_table_indices();
        let mut table = self.root.paddr();
        for index in [l0, l1, l2] {
            let entry = self.table(table)[index];
            if !entry.is_table() {
                return None;
            }
            table = entry.addr();
        }
        Some(table)
    }

    /// Install (or replace) the leaf entry for `vaddr`.
    ///
    /// Returns the previous entry so the caller knows whether a flush is due.
    pub fn map_page(
        &mut self,
        allocator: &PhysicalPageAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
    ) -> Result<PageTableEntry, VmError> {
        self.check_address(vaddr)?;
        if !paddr.is_aligned() {
            return Err(VmError::MisalignedAddress);
        }
        if self.kind == DirectoryKind::User && !flags.contains(PageFlags::AP_USER) {
            return Err(VmError::InvalidPermissions);
        }

        let l3 = self.ensure_table(allocator, vaddr)?;
        let (_, _, _, index) = vaddr.page_table_indices();
        let table = self.table(l3);
        let previous = table[index];
        table[index] = PageTableEntry::page(paddr, flags);
        Ok(previous)
    }

    /// Clear the leaf entry for `vaddr`. Returns the entry that was removed.
    pub fn unmap_page(&mut self, vaddr: VirtAddr) -> Option<PageTableEntry> {
        self.check_address(vaddr).ok()?;
        let l3 = self.find_table(vaddr)?;
        let (_, _, _, index) = vaddr.page_table_indices();
        let table = self.table(l3);
        let previous = table[index];
        if !previous.is_valid() {
            return None;
        }
        table[index].clear();
        Some(previous)
    }

    /// The valid leaf entry for `vaddr`, if any.
    pub fn entry(&self, vaddr: VirtAddr) -> Option<PageTableEntry> {
        let l3 = self.find_table(vaddr.align_down())?;
        let (_, _, _, index) = vaddr.page_table_indices();
        let entry = self.table(l3)[index];
        entry.is_valid().then_some(entry)
    }

    /// Translate a virtual address to the physical address it maps to.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.entry(vaddr)
            .map(|entry| entry.addr().add(vaddr.page_offset()))
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        debug!(
            "[MM] tearing down {:?} page directory {} ({} tables)",
            self.kind,
            self.root.paddr(),
            self.tables.len()
        );
    }
}
