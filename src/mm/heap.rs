//! Kernel Heap
//!
//! A `linked_list_allocator` heap laid over a contiguous kernel region. The
//! backing frames are physically contiguous, so the heap is addressed through
//! the physical window and never faults.
//!
//! # Security Considerations
//! - The backing region is mapped read/write, never executable
//! - Exhaustion is reported as `VmError::OutOfMemory`, never a panic

use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::LockedHeap;
use log::{info, warn};

use super::error::VmError;
use super::manager::{KernelRegion, MemoryManager};
use super::region::Access;

/// A heap owning its backing kernel region.
pub struct KernelHeap {
    heap: LockedHeap,
    region: KernelRegion,
}

impl KernelHeap {
    /// Carve a heap of `size` bytes (rounded up to pages) out of fresh
    /// contiguous memory.
    pub fn new(mm: &Arc<MemoryManager>, size: usize) -> Result<Self, VmError> {
        let vmobject = mm.allocate_contiguous_vmobject(size)?;
        let first = vmobject.physical_page(0).ok_or(VmError::OutOfMemory)?;
        let size = vmobject.size();
        let region =
            mm.allocate_kernel_region_with_vmobject(vmobject, size, "Kernel heap", Access::READ_WRITE, true)?;
        let bottom = mm.allocator().memory().frame_ptr(first.paddr());

        let heap = LockedHeap::empty();
        // SAFETY: `bottom` starts `size` bytes of contiguous frames owned by
        // the region's VMObject, which lives as long as the heap.
        unsafe { heap.lock().init(bottom, size) };
        info!("[MM] kernel heap: {} bytes at {:?}", size, region.range());
        Ok(Self { heap, region })
    }

    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, VmError> {
        self.heap.lock().allocate_first_fit(layout).map_err(|()| {
            warn!(
                "[MM] kernel heap exhausted: size={}, align={}",
                layout.size(),
                layout.align()
            );
            VmError::OutOfMemory
        })
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap with
    /// the same `layout`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarded from the caller.
        unsafe { self.heap.lock().deallocate(ptr, layout) }
    }

    pub fn size(&self) -> usize {
        self.heap.lock().size()
    }

    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }

    pub fn free(&self) -> usize {
        self.heap.lock().free()
    }

    pub fn region(&self) -> &KernelRegion {
        &self.region
    }
}
