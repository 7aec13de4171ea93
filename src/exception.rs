//! ARM64 Abort Handling
//!
//! Decodes data and instruction aborts from the saved exception context and
//! feeds them through the page-fault dispatcher.
//!
//! # Exception Levels
//! - EL0: User applications (lower EL aborts)
//! - EL1: Kernel (same EL aborts)
//!
//! # Fault Status Codes (DFSC/IFSC, ISS[5:0])
//! - `0b0000xx`: address size fault at level xx, a corrupt descriptor
//! - `0b0001xx`: translation fault, nothing mapped
//! - `0b0010xx`: access flag fault, treated like a translation fault
//! - `0b0011xx`: permission fault
//!
//! Anything else (external aborts, alignment, TLB conflicts) is not a page
//! fault and is left to the caller.

use log::{debug, error};

use crate::fault::{
    dispatch, AccessKind, ExecutionMode, FaultKind, FaultResolution, PageFault, ThreadContext,
};
use crate::mm::address::VirtAddr;
use crate::mm::manager::MemoryManager;

/// Exception context saved on the stack
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionContext {
    /// General purpose registers x0-x30
    pub gpr: [u64; 31],
    /// Stack pointer of the interrupted EL0 context
    pub sp_el0: u64,
    /// Exception Link Register (return address)
    pub elr: u64,
    /// Saved Program Status Register
    pub spsr: u64,
    /// Exception Syndrome Register
    pub esr: u64,
    /// Fault Address Register
    pub far: u64,
}

/// Exception class extracted from ESR_EL1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionClass {
    Unknown = 0x00,
    SvcAarch64 = 0x15,
    InstructionAbortLowerEl = 0x20,
    InstructionAbortSameEl = 0x21,
    DataAbortLowerEl = 0x24,
    DataAbortSameEl = 0x25,
    Other = 0xFF,
}

impl From<u64> for ExceptionClass {
    fn from(esr: u64) -> Self {
        let ec = ((esr >> 26) & 0x3F) as u8;
        match ec {
            0x00 => ExceptionClass::Unknown,
            0x15 => ExceptionClass::SvcAarch64,
            0x20 => ExceptionClass::InstructionAbortLowerEl,
            0x21 => ExceptionClass::InstructionAbortSameEl,
            0x24 => ExceptionClass::DataAbortLowerEl,
            0x25 => ExceptionClass::DataAbortSameEl,
            _ => ExceptionClass::Other,
        }
    }
}

/// ISS bit 6: the data abort was caused by a write.
const ESR_WNR: u64 = 1 << 6;
const ESR_FSC_MASK: u64 = 0x3F;

/// Turn an abort in `ctx` into a page fault, or `None` if it is not one.
pub fn decode_abort(ctx: &ExceptionContext) -> Option<PageFault> {
    let class = ExceptionClass::from(ctx.esr);
    let (mode, instruction) = match class {
        ExceptionClass::InstructionAbortLowerEl => (ExecutionMode::User, true),
        ExceptionClass::InstructionAbortSameEl => (ExecutionMode::Kernel, true),
        ExceptionClass::DataAbortLowerEl => (ExecutionMode::User, false),
        ExceptionClass::DataAbortSameEl => (ExecutionMode::Kernel, false),
        _ => return None,
    };

    let status = ctx.esr & ESR_FSC_MASK;
    let (kind, reserved) = match status >> 2 {
        0b0000 => (FaultKind::ProtectionViolation, true),
        0b0001 | 0b0010 => (FaultKind::PageNotPresent, false),
        0b0011 => (FaultKind::ProtectionViolation, false),
        _ => {
            debug!("[PAGEFAULT] abort with status {:#x} is not a page fault", status);
            return None;
        }
    };

    let access = if instruction {
        AccessKind::Execute
    } else if ctx.esr & ESR_WNR != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    };

    let mut fault = PageFault::new(VirtAddr::new(ctx.far as usize), kind, access, mode)
        .with_instruction_pointer(ctx.elr as usize);
    if mode == ExecutionMode::User {
        fault = fault.with_stack_pointer(ctx.sp_el0 as usize);
    }
    if reserved {
        fault = fault.with_reserved_bit_violation();
    }
    Some(fault)
}

/// Handle an abort taken by `thread` and apply the outcome to `ctx`.
///
/// A recovery resolution rewrites the return address; the remaining ones
/// are handed back for the scheduler to act on. Returns `None` if the
/// exception is not a page fault.
///
/// # Panics
/// Panics when the fault is an unrecoverable kernel fault.
pub fn handle_abort(
    ctx: &mut ExceptionContext,
    mm: &MemoryManager,
    thread: &dyn ThreadContext,
) -> Option<FaultResolution> {
    let fault = decode_abort(ctx)?;
    let resolution = dispatch(mm, &fault, thread);
    match resolution {
        FaultResolution::RecoverAt(recovery) => {
            debug!("[PAGEFAULT] resuming at landing pad {:#x}", recovery);
            ctx.elr = recovery as u64;
        }
        FaultResolution::KernelPanic(reason) => {
            error!("!!! KERNEL PAGE FAULT !!!");
            error!("ESR: 0x{:016x}", ctx.esr);
            error!("ELR: 0x{:016x}", ctx.elr);
            error!("FAR: 0x{:016x}", ctx.far);
            panic!("{}", reason);
        }
        FaultResolution::Resume
        | FaultResolution::SignalDelivered(_)
        | FaultResolution::Terminate { .. } => {}
    }
    Some(resolution)
}
