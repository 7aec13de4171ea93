//! AArch64 implementation of [`Processor`].
//!
//! Local invalidation uses the non-shareable `tlbi vae1`; the shootdown uses
//! the inner-shareable `tlbi vae1is`, which the interconnect broadcasts to
//! every core, so no IPI round-trip is needed.

use core::arch::asm;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{CpuId, Processor};
use crate::mm::address::{VirtAddr, MAX_CPUS, PAGE_SHIFT, PAGE_SIZE};

/// ARMv8 CPU services.
pub struct Aarch64Processor {
    cpu_count: usize,
    irq_depth: [AtomicUsize; MAX_CPUS],
}

impl Aarch64Processor {
    pub const fn new(cpu_count: usize) -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            cpu_count,
            irq_depth: [ZERO; MAX_CPUS],
        }
    }

    /// Called by the IRQ vector on entry.
    pub fn enter_irq(&self) {
        self.irq_depth[self.current_cpu()].fetch_add(1, Ordering::Relaxed);
    }

    /// Called by the IRQ vector before `eret`.
    pub fn leave_irq(&self) {
        self.irq_depth[self.current_cpu()].fetch_sub(1, Ordering::Relaxed);
    }
}

impl Processor for Aarch64Processor {
    fn current_cpu(&self) -> CpuId {
        let mpidr: u64;
        // SAFETY: Reading MPIDR_EL1 has no side effects at EL1.
        unsafe {
            asm!("mrs {v}, mpidr_el1", v = out(reg) mpidr, options(nomem, nostack, preserves_flags));
        }
        // Aff0 numbers the cores of the QEMU virt cluster.
        (mpidr & 0xFF) as usize
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn in_irq(&self) -> bool {
        self.irq_depth[self.current_cpu()].load(Ordering::Relaxed) > 0
    }

    fn flush_tlb_local(&self, vaddr: VirtAddr, page_count: usize) {
        for i in 0..page_count {
            let page = (vaddr.as_usize() + i * PAGE_SIZE) >> PAGE_SHIFT;
            // SAFETY: TLB maintenance only drops cached translations.
            unsafe {
                asm!("tlbi vae1, {addr}", addr = in(reg) page, options(nostack, preserves_flags));
            }
        }
        // SAFETY: Barriers have no memory-safety implications.
        unsafe {
            asm!("dsb nsh", "isb", options(nostack, preserves_flags));
        }
    }

    fn flush_tlb_others(&self, vaddr: VirtAddr, page_count: usize) {
        for i in 0..page_count {
            let page = (vaddr.as_usize() + i * PAGE_SIZE) >> PAGE_SHIFT;
            // SAFETY: TLB maintenance only drops cached translations.
            unsafe {
                asm!("tlbi vae1is, {addr}", addr = in(reg) page, options(nostack, preserves_flags));
            }
        }
        // SAFETY: Waits for the broadcast invalidation to complete.
        unsafe {
            asm!("dsb ish", "isb", options(nostack, preserves_flags));
        }
    }

    fn flush_tlb_all(&self) {
        // SAFETY: Invalidate all stage 1 EL1 translations, inner shareable.
        unsafe {
            asm!("tlbi vmalle1is", "dsb ish", "isb", options(nostack, preserves_flags));
        }
    }
}
