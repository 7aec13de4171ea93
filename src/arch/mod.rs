//! CPU services the memory manager needs from the architecture layer.
//!
//! Everything that must execute a privileged instruction (TLB maintenance,
//! reading the CPU id) goes through [`Processor`], so the rest of the crate
//! stays portable and testable on a host.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;

use log::trace;

use crate::mm::address::VirtAddr;

/// Index of a CPU, `0..cpu_count()`.
pub type CpuId = usize;

/// Per-CPU services used by paging and fault handling.
pub trait Processor: Send + Sync {
    /// The CPU executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Number of CPUs brought up.
    fn cpu_count(&self) -> usize;

    /// Whether the caller runs in interrupt context on this CPU.
    fn in_irq(&self) -> bool;

    /// Invalidate this CPU's translations for `page_count` pages at `vaddr`.
    fn flush_tlb_local(&self, vaddr: VirtAddr, page_count: usize);

    /// Invalidate the same range on every other CPU and wait for completion.
    fn flush_tlb_others(&self, vaddr: VirtAddr, page_count: usize);

    /// Drop every non-global translation on every CPU.
    fn flush_tlb_all(&self);
}

/// Invalidate a range after a leaf mapping changed.
///
/// Every other CPU is shot down, not only those that ran the address space:
/// no per-address-space residency set is kept.
pub fn flush_tlb(processor: &dyn Processor, vaddr: VirtAddr, page_count: usize) {
    if page_count == 0 {
        return;
    }
    trace!("[TLB] flush {} page(s) at {}", page_count, vaddr);
    processor.flush_tlb_local(vaddr, page_count);
    if processor.cpu_count() > 1 {
        processor.flush_tlb_others(vaddr, page_count);
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use super::*;
    use crate::testing::SimulatedProcessor;

    #[test]
    fn test_single_cpu_flush_stays_local() {
        let cpu = SimulatedProcessor::new(1);
        flush_tlb(&cpu, VirtAddr::new(0x40_0000), 3);
        assert_eq!(cpu.local_flushes.load(Ordering::Relaxed), 1);
        assert_eq!(cpu.shootdowns.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_smp_flush_shoots_down_the_others() {
        let cpu = SimulatedProcessor::new(4);
        flush_tlb(&cpu, VirtAddr::new(0x40_0000), 1);
        assert_eq!(cpu.local_flushes.load(Ordering::Relaxed), 1);
        assert_eq!(cpu.shootdowns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_empty_flush_is_a_no_op() {
        let cpu = SimulatedProcessor::new(4);
        flush_tlb(&cpu, VirtAddr::new(0x40_0000), 0);
        assert_eq!(cpu.local_flushes.load(Ordering::Relaxed), 0);
        assert_eq!(cpu.shootdowns.load(Ordering::Relaxed), 0);
    }
}
