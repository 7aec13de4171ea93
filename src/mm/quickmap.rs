//! Per-CPU temporary mappings of arbitrary physical frames.
//!
//! Each CPU owns one page-sized slot at `QUICKMAP_BASE + cpu * PAGE_SIZE`.
//! The L3 table covering the slots is created once at boot; mapping a slot
//! rewrites a single entry in that table without taking the kernel address
//! space lock, so the quickmap is usable from the page-fault path while
//! that lock is held.
//!
//! A slot must not be held across anything that can reschedule. Code that
//! can interrupt a slot holder uses `try_map` instead of `map`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use log::trace;

use super::address::{PhysAddr, VirtAddr, MAX_CPUS, PAGE_SIZE, QUICKMAP_BASE};
use super::error::VmError;
use super::frame::PhysicalPageAllocator;
use super::page_directory::PageDirectory;
use super::paging::{PageFlags, PageTableEntry};
use super::physical::PhysicalMemory;
use crate::arch::{CpuId, Processor};

/// The per-CPU slot table.
pub struct QuickMap {
    table: PhysAddr,
    in_use: Vec<AtomicBool>,
    memory: Arc<PhysicalMemory>,
    processor: Arc<dyn Processor>,
}

impl QuickMap {
    /// Reserve the slot table inside the kernel directory.
    ///
    /// # Panics
    /// Panics if the processor reports more CPUs than there are slots.
    pub fn new(
        kernel: &mut PageDirectory,
        allocator: &PhysicalPageAllocator,
        processor: Arc<dyn Processor>,
    ) -> Result<Self, VmError> {
        let cpus = processor.cpu_count();
        assert!(cpus <= MAX_CPUS, "{} CPUs exceed the {} quickmap slots", cpus, MAX_CPUS);
        let table = kernel.ensure_table(allocator, VirtAddr::new(QUICKMAP_BASE))?;
        Ok(Self {
            table,
            in_use: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
            memory: allocator.memory().clone(),
            processor,
        })
    }

    /// Virtual address of `cpu`'s slot.
    #[inline]
    pub fn slot_vaddr(cpu: CpuId) -> VirtAddr {
        VirtAddr::new(QUICKMAP_BASE + cpu * PAGE_SIZE)
    }

    /// Map `paddr` into the calling CPU's slot.
    ///
    /// # Panics
    /// Panics if this CPU already holds its slot.
    pub fn map(&self, paddr: PhysAddr) -> QuickMapGuard<'_> {
        match self.try_map(paddr) {
            Some(guard) => guard,
            None => panic!(
                "quickmap slot of CPU {} is already in use",
                self.processor.current_cpu()
            ),
        }
    }

    /// Like [`map`](Self::map), but `None` if the slot is taken. Interrupt
    /// handlers may land on a CPU whose slot the interrupted code holds.
    pub fn try_map(&self, paddr: PhysAddr) -> Option<QuickMapGuard<'_>> {
        let cpu = self.processor.current_cpu();
        if self.in_use[cpu].swap(true, Ordering::Acquire) {
            return None;
        }
        self.write_slot(cpu, PageTableEntry::page(paddr, PageFlags::KERNEL_DATA));
        self.processor.flush_tlb_local(Self::slot_vaddr(cpu), 1);
        trace!("[MM] quickmap {} on CPU {}", paddr, cpu);
        Some(QuickMapGuard {
            quickmap: self,
            cpu,
            paddr,
            _not_send: PhantomData,
        })
    }

    fn write_slot(&self, cpu: CpuId, entry: PageTableEntry) {
        let entries = self.memory.frame_ptr(self.table).cast::<u64>();
        // SAFETY: cpu < MAX_CPUS <= 512 entries; slot `cpu` is written only
        // by its own CPU while holding `in_use[cpu]`.
        unsafe { entries.add(cpu).write_volatile(entry.as_u64()) };
    }

    /// The entry currently installed in `cpu`'s slot.
    pub fn slot_entry(&self, cpu: CpuId) -> PageTableEntry {
        let entries = self.memory.frame_ptr(self.table).cast::<PageTableEntry>();
        // SAFETY: In bounds as above; a torn read is impossible for an aligned u64.
        unsafe { entries.add(cpu).read_volatile() }
    }
}

/// A live quickmap slot. Unmapped and released on drop.
pub struct QuickMapGuard<'a> {
    quickmap: &'a QuickMap,
    cpu: CpuId,
    paddr: PhysAddr,
    /// Pinned to the CPU whose slot it holds.
    _not_send: PhantomData<*const ()>,
}

impl QuickMapGuard<'_> {
    #[inline]
    pub fn vaddr(&self) -> VirtAddr {
        QuickMap::slot_vaddr(self.cpu)
    }

    #[inline]
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    #[cfg(target_os = "none")]
    fn data_ptr(&self) -> *mut u8 {
        self.vaddr().as_usize() as *mut u8
    }

    #[cfg(not(target_os = "none"))]
    fn data_ptr(&self) -> *mut u8 {
        self.quickmap.memory.frame_ptr(self.paddr)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The slot maps exactly one frame for the guard's lifetime.
        unsafe { core::slice::from_raw_parts(self.data_ptr(), PAGE_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As above; `&mut self` makes the borrow unique.
        unsafe { core::slice::from_raw_parts_mut(self.data_ptr(), PAGE_SIZE) }
    }
}

impl Drop for QuickMapGuard<'_> {
    fn drop(&mut self) {
        self.quickmap.write_slot(self.cpu, PageTableEntry::invalid());
        self.quickmap
            .processor
            .flush_tlb_local(QuickMap::slot_vaddr(self.cpu), 1);
        self.quickmap.in_use[self.cpu].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::config::MemoryConfig;
    use crate::mm::frame::ShouldZeroFill;
    use crate::mm::page_directory::DirectoryKind;
    use crate::testing::{HostRam, SimulatedProcessor};

    struct Fixture {
        _ram: HostRam,
        allocator: PhysicalPageAllocator,
        _kernel: PageDirectory,
        quickmap: QuickMap,
    }

    fn fixture(cpus: usize) -> Fixture {
        let ram = HostRam::new(16);
        let config = MemoryConfig::single_range(ram.base(), 16, 8);
        let allocator = PhysicalPageAllocator::new(&config, ram.memory());
        let mut kernel = PageDirectory::new(&allocator, DirectoryKind::Kernel).unwrap();
        let processor = Arc::new(SimulatedProcessor::new(cpus));
        let quickmap = QuickMap::new(&mut kernel, &allocator, processor).unwrap();
        Fixture {
            _ram: ram,
            allocator,
            _kernel: kernel,
            quickmap,
        }
    }

    #[test]
    fn test_slot_entry_lives_only_while_guard_is_held() {
        let f = fixture(1);
        let frame = f.allocator.allocate_user_page(ShouldZeroFill::Yes).unwrap();
        {
            let mut guard = f.quickmap.map(frame.paddr());
            assert_eq!(guard.vaddr(), VirtAddr::new(QUICKMAP_BASE));
            let entry = f.quickmap.slot_entry(0);
            assert!(entry.is_valid());
            assert_eq!(entry.addr(), frame.paddr());
            guard.as_mut_slice()[10] = 0x5A;
        }
        assert!(!f.quickmap.slot_entry(0).is_valid());

        let guard = f.quickmap.map(frame.paddr());
        assert_eq!(guard.as_slice()[10], 0x5A);
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_double_acquire_on_one_cpu_panics() {
        let f = fixture(1);
        let frame = f.allocator.allocate_user_page(ShouldZeroFill::Yes).unwrap();
        let _first = f.quickmap.map(frame.paddr());
        let _second = f.quickmap.map(frame.paddr());
    }

    #[test]
    fn test_try_map_reports_a_busy_slot() {
        let f = fixture(1);
        let frame = f.allocator.allocate_user_page(ShouldZeroFill::Yes).unwrap();
        let held = f.quickmap.map(frame.paddr());
        assert!(f.quickmap.try_map(frame.paddr()).is_none());
        assert_eq!(f.quickmap.slot_entry(0).addr(), frame.paddr());
        drop(held);
        assert!(f.quickmap.try_map(frame.paddr()).is_some());
    }

    #[test]
    fn test_cpus_use_distinct_slots() {
        let f = fixture(2);
        let frame = f.allocator.allocate_user_page(ShouldZeroFill::Yes).unwrap();
        let first = f.quickmap.map(frame.paddr());
        SimulatedProcessor::set_current_cpu(1);
        let second = f.quickmap.map(frame.paddr());
        assert_eq!(second.vaddr(), QuickMap::slot_vaddr(1));
        drop(second);
        SimulatedProcessor::set_current_cpu(0);
        drop(first);
    }
}
