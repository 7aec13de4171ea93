//! Kernel access to user memory.
//!
//! User pages are reached by walking the address space's own translations
//! and touching the frame through the quickmap, so a copy behaves like the
//! hardware would: a missing or read-only translation raises a page fault,
//! and the copy retries once the fault is resolved.
//!
//! # Two flavours
//! - `copy_from_user` / `copy_to_user`: syscall paths. The range is
//!   validated first and faults go straight to the memory manager.
//! - `safe_*`: accesses through pointers that may be garbage, possibly from IRQ
//!   context. A landing pad is registered for the duration and faults go
//!   through the dispatcher; anything but a resolved fault ends the call
//!   with [`FaultOccurred`].

use core::fmt;

use log::debug;

use super::address::{VirtAddr, VirtualRange, PAGE_SIZE, USER_RANGE_BASE, USER_RANGE_END};
use super::address_space::AddressSpace;
use super::manager::MemoryManager;
use super::paging::PageTableEntry;
use crate::fault::{
    dispatch, AccessKind, ExecutionMode, FaultKind, FaultResolution, LandingPad, PageFault,
    PageFaultResponse, ThreadContext,
};

/// Faults per page a copy will resolve before giving up.
const MAX_FAULT_RETRIES: usize = 4;

/// A user copy hit memory the caller may not access (EFAULT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyError {
    Efault { vaddr: VirtAddr },
}

impl fmt::Display for UserCopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Efault { vaddr } => write!(f, "bad user address {}", vaddr),
        }
    }
}

/// A guarded access faulted and was recovered at its landing pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultOccurred {
    pub vaddr: VirtAddr,
}

impl fmt::Display for FaultOccurred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guarded access faulted at {}", self.vaddr)
    }
}

// Guarded accesses report this as the faulting instruction; the pad covers
// it and names the recovery routine.
#[inline(never)]
fn guarded_access_site() {}

#[inline(never)]
fn guarded_access_recovery() {}

fn guarded_pad() -> LandingPad {
    let start = guarded_access_site as usize;
    LandingPad {
        start,
        end: start + 1,
        recovery: guarded_access_recovery as usize,
    }
}

fn within_user_range(vaddr: VirtAddr, len: usize) -> bool {
    VirtualRange::new(VirtAddr::new(USER_RANGE_BASE), USER_RANGE_END - USER_RANGE_BASE)
        .is_some_and(|window| window.contains_span(vaddr, len))
}

impl MemoryManager {
    /// Run `f` on the frame behind `vaddr` if the current translation
    /// permits `access`; otherwise report what kind of fault the hardware
    /// would raise.
    fn access_user_page(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        access: AccessKind,
        nonblocking: bool,
        f: impl FnOnce(&mut [u8]),
    ) -> Result<(), FaultKind> {
        let touch = |entry: Option<PageTableEntry>| {
            let entry = match entry {
                Some(entry) if entry.is_valid() => entry,
                _ => return Err(FaultKind::PageNotPresent),
            };
            if access == AccessKind::Write && !entry.is_writable() {
                return Err(FaultKind::ProtectionViolation);
            }
            let mut frame = if nonblocking {
                // The interrupted code may hold this CPU's slot.
                self.quickmap()
                    .try_map(entry.addr())
                    .ok_or(FaultKind::PageNotPresent)?
            } else {
                self.quickmap().map(entry.addr())
            };
            f(frame.as_mut_slice());
            Ok(())
        };
        let page = vaddr.align_down();
        if nonblocking {
            space
                .try_with_translation(page, touch)
                .unwrap_or(Err(FaultKind::PageNotPresent))
        } else {
            space.with_translation(page, touch)
        }
    }

    /// Walk `[start, start + len)` page by page, handing `chunk` the offset
    /// into the caller's buffer and the matching bytes of the frame. Faults
    /// are passed to `resolve`; it returns whether to retry.
    #[allow(clippy::too_many_arguments)]
    fn walk_user(
        &self,
        space: &AddressSpace,
        start: VirtAddr,
        len: usize,
        access: AccessKind,
        nonblocking: bool,
        mut resolve: impl FnMut(&PageFault) -> bool,
        mut chunk: impl FnMut(usize, &mut [u8]),
    ) -> Result<(), VirtAddr> {
        let mut done = 0;
        while done < len {
            let vaddr = start.add(done);
            let in_page = vaddr.page_offset();
            let count = (PAGE_SIZE - in_page).min(len - done);
            let mut faults = 0;
            loop {
                let result = self.access_user_page(space, vaddr, access, nonblocking, |frame| {
                    chunk(done, &mut frame[in_page..in_page + count])
                });
                let Err(kind) = result else {
                    break;
                };
                faults += 1;
                let fault = PageFault::new(vaddr, kind, access, ExecutionMode::Kernel)
                    .with_instruction_pointer(guarded_access_site as usize);
                if faults > MAX_FAULT_RETRIES || !resolve(&fault) {
                    return Err(vaddr);
                }
            }
            done += count;
        }
        Ok(())
    }

    fn resolve_for_copy(&self, space: &AddressSpace, fault: &PageFault) -> bool {
        self.handle_page_fault(Some(space), fault) == PageFaultResponse::Continue
    }

    /// Copy `dst.len()` bytes from user address `src`.
    pub fn copy_from_user(
        &self,
        space: &AddressSpace,
        src: VirtAddr,
        dst: &mut [u8],
    ) -> Result<(), UserCopyError> {
        if !self.validate_user_read(space, src, dst.len()) {
            return Err(UserCopyError::Efault { vaddr: src });
        }
        self.walk_user(
            space,
            src,
            dst.len(),
            AccessKind::Read,
            false,
            |fault| self.resolve_for_copy(space, fault),
            |offset, frame| dst[offset..offset + frame.len()].copy_from_slice(frame),
        )
        .map_err(|vaddr| UserCopyError::Efault { vaddr })
    }

    /// Copy `src` to user address `dst`, breaking copy-on-write as needed.
    pub fn copy_to_user(
        &self,
        space: &AddressSpace,
        dst: VirtAddr,
        src: &[u8],
    ) -> Result<(), UserCopyError> {
        if !self.validate_user_write(space, dst, src.len()) {
            return Err(UserCopyError::Efault { vaddr: dst });
        }
        self.walk_user(
            space,
            dst,
            src.len(),
            AccessKind::Write,
            false,
            |fault| self.resolve_for_copy(space, fault),
            |offset, frame| frame.copy_from_slice(&src[offset..offset + frame.len()]),
        )
        .map_err(|vaddr| UserCopyError::Efault { vaddr })
    }

    /// Run one guarded walk over `thread`'s address space.
    fn guarded(
        &self,
        thread: &dyn ThreadContext,
        start: VirtAddr,
        len: usize,
        access: AccessKind,
        chunk: impl FnMut(usize, &mut [u8]),
    ) -> Result<(), FaultOccurred> {
        if len == 0 {
            return Ok(());
        }
        let space = match thread.address_space() {
            Some(space) if within_user_range(start, len) => space,
            _ => return Err(FaultOccurred { vaddr: start }),
        };
        let in_irq = self.processor().in_irq();
        let _pad = self
            .landing_pads()
            .register(self.processor().current_cpu(), guarded_pad());
        let result = self.walk_user(
            &space,
            start,
            len,
            access,
            in_irq,
            |fault| match dispatch(self, fault, thread) {
                FaultResolution::Resume => true,
                resolution => {
                    debug!("[MM] guarded access at {}: {:?}", fault.vaddr(), resolution);
                    false
                }
            },
            chunk,
        );
        result.map_err(|vaddr| FaultOccurred { vaddr })
    }

    /// Copy from a user pointer that may be invalid.
    pub fn safe_memcpy_from_user(
        &self,
        thread: &dyn ThreadContext,
        src: VirtAddr,
        dst: &mut [u8],
    ) -> Result<(), FaultOccurred> {
        self.guarded(thread, src, dst.len(), AccessKind::Read, |offset, frame| {
            dst[offset..offset + frame.len()].copy_from_slice(frame)
        })
    }

    /// Copy to a user pointer that may be invalid.
    pub fn safe_memcpy_to_user(
        &self,
        thread: &dyn ThreadContext,
        dst: VirtAddr,
        src: &[u8],
    ) -> Result<(), FaultOccurred> {
        self.guarded(thread, dst, src.len(), AccessKind::Write, |offset, frame| {
            frame.copy_from_slice(&src[offset..offset + frame.len()])
        })
    }

    /// Fill `len` bytes at a user pointer that may be invalid.
    pub fn safe_memset(
        &self,
        thread: &dyn ThreadContext,
        dst: VirtAddr,
        value: u8,
        len: usize,
    ) -> Result<(), FaultOccurred> {
        self.guarded(thread, dst, len, AccessKind::Write, |_, frame| frame.fill(value))
    }
}
