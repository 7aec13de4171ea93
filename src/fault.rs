//! Page Fault Dispatch
//!
//! Turns one fault occurrence into a decision for the trap entry point:
//! resume, jump to a landing pad, deliver a signal, terminate the process,
//! or panic the kernel. Region and VMObject code only ever produce a
//! [`PageFaultResponse`]; everything about process control flow lives here.
//!
//! # Order of checks
//! 1. Reserved-bit violations are kernel bugs: panic
//! 2. Kernel fault in IRQ context inside a landing pad: recover there
//!    before touching any address-space lock
//! 3. User fault with a stack pointer outside a mapped stack: terminate
//! 4. Resolve through the memory manager
//! 5. On failure: landing pad (kernel), signal handler (user, not for OOM),
//!    else terminate with the fault recorded for the core dump

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, error, warn};

use crate::arch::CpuId;
use crate::mm::address::VirtAddr;
use crate::mm::address_space::AddressSpace;
use crate::mm::manager::MemoryManager;

/// Why the translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    PageNotPresent,
    ProtectionViolation,
}

/// What the faulting instruction tried to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Exception level the fault was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    User,
    Kernel,
}

/// One fault occurrence, as decoded from the exception syndrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    vaddr: VirtAddr,
    kind: FaultKind,
    access: AccessKind,
    mode: ExecutionMode,
    reserved_bit_violation: bool,
    instruction_pointer: usize,
    stack_pointer: usize,
}

impl PageFault {
    pub const fn new(
        vaddr: VirtAddr,
        kind: FaultKind,
        access: AccessKind,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            vaddr,
            kind,
            access,
            mode,
            reserved_bit_violation: false,
            instruction_pointer: 0,
            stack_pointer: 0,
        }
    }

    pub const fn with_instruction_pointer(mut self, ip: usize) -> Self {
        self.instruction_pointer = ip;
        self
    }

    pub const fn with_stack_pointer(mut self, sp: usize) -> Self {
        self.stack_pointer = sp;
        self
    }

    pub const fn with_reserved_bit_violation(mut self) -> Self {
        self.reserved_bit_violation = true;
        self
    }

    #[inline]
    pub const fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    #[inline]
    pub const fn kind(&self) -> FaultKind {
        self.kind
    }

    #[inline]
    pub const fn access(&self) -> AccessKind {
        self.access
    }

    #[inline]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    #[inline]
    pub const fn instruction_pointer(&self) -> usize {
        self.instruction_pointer
    }

    #[inline]
    pub const fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    pub fn is_read(&self) -> bool {
        self.access == AccessKind::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == AccessKind::Write
    }

    pub fn is_instruction_fetch(&self) -> bool {
        self.access == AccessKind::Execute
    }

    pub fn is_not_present(&self) -> bool {
        self.kind == FaultKind::PageNotPresent
    }

    pub fn is_protection_violation(&self) -> bool {
        self.kind == FaultKind::ProtectionViolation
    }

    pub fn faulted_in_kernel(&self) -> bool {
        self.mode == ExecutionMode::Kernel
    }

    pub fn is_reserved_bit_violation(&self) -> bool {
        self.reserved_bit_violation
    }
}

/// Outcome of resolving a fault against the region that covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// Retry the faulting instruction.
    Continue,
    ShouldCrash,
    OutOfMemory,
    BusError,
}

/// Signals the dispatcher can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signal {
    Kill,
    Bus,
    Segv,
}

impl Signal {
    pub const fn number(self) -> u8 {
        match self {
            Self::Kill => 9,
            Self::Bus => 7,
            Self::Segv => 11,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kill => write!(f, "SIGKILL"),
            Self::Bus => write!(f, "SIGBUS"),
            Self::Segv => write!(f, "SIGSEGV"),
        }
    }
}

/// The current thread, as far as fault handling is concerned.
pub trait ThreadContext {
    fn address_space(&self) -> Option<Arc<AddressSpace>>;
    fn has_signal_handler(&self, signal: Signal) -> bool;
    fn send_urgent_signal_to_self(&self, signal: Signal);
    /// Attach a key/value pair to the core dump of this process.
    fn set_coredump_property(&self, key: &str, value: &str);
}

/// What the trap entry point must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// Return to the faulting instruction.
    Resume,
    /// Return to this recovery address instead.
    RecoverAt(usize),
    /// A handler is installed; the signal is pending.
    SignalDelivered(Signal),
    /// Kill the process.
    Terminate {
        signal: Signal,
        reason: &'static str,
    },
    /// The kernel itself is broken.
    KernelPanic(&'static str),
}

/// A code range whose faults are recoverable, and where to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandingPad {
    pub start: usize,
    pub end: usize,
    pub recovery: usize,
}

impl LandingPad {
    pub fn covers(&self, ip: usize) -> bool {
        ip >= self.start && ip < self.end
    }
}

#[derive(Default)]
struct PadSlot {
    active: AtomicBool,
    start: AtomicUsize,
    end: AtomicUsize,
    recovery: AtomicUsize,
}

impl PadSlot {
    fn load(&self) -> Option<LandingPad> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        Some(LandingPad {
            start: self.start.load(Ordering::Relaxed),
            end: self.end.load(Ordering::Relaxed),
            recovery: self.recovery.load(Ordering::Relaxed),
        })
    }

    fn store(&self, pad: Option<LandingPad>) {
        self.active.store(false, Ordering::Release);
        if let Some(pad) = pad {
            self.start.store(pad.start, Ordering::Relaxed);
            self.end.store(pad.end, Ordering::Relaxed);
            self.recovery.store(pad.recovery, Ordering::Relaxed);
            self.active.store(true, Ordering::Release);
        }
    }
}

/// Per-CPU registered landing pads.
///
/// Lookups are lock-free so they are safe from IRQ context on the CPU that
/// registered the pad.
pub struct LandingPads {
    slots: Vec<PadSlot>,
}

impl LandingPads {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            slots: (0..cpu_count).map(|_| PadSlot::default()).collect(),
        }
    }

    /// Register `pad` for `cpu` until the guard drops. A pad registered
    /// earlier on the same CPU is restored afterwards.
    pub fn register(&self, cpu: CpuId, pad: LandingPad) -> LandingPadGuard<'_> {
        let slot = &self.slots[cpu];
        let previous = slot.load();
        slot.store(Some(pad));
        LandingPadGuard {
            slot,
            previous,
        }
    }

    /// Recovery address for a fault at `ip` on `cpu`, if a pad covers it.
    pub fn lookup(&self, cpu: CpuId, ip: usize) -> Option<usize> {
        self.slots
            .get(cpu)
            .and_then(PadSlot::load)
            .filter(|pad| pad.covers(ip))
            .map(|pad| pad.recovery)
    }
}

/// Keeps a landing pad registered.
pub struct LandingPadGuard<'a> {
    slot: &'a PadSlot,
    previous: Option<LandingPad>,
}

impl Drop for LandingPadGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(self.previous);
    }
}

fn fault_type_name(fault: &PageFault) -> &'static str {
    match fault.kind() {
        FaultKind::PageNotPresent => "NotPresent",
        FaultKind::ProtectionViolation => "ProtectionViolation",
    }
}

fn fault_access_name(fault: &PageFault) -> &'static str {
    match fault.access() {
        AccessKind::Read => "Read",
        AccessKind::Write => "Write",
        AccessKind::Execute => "Execute",
    }
}

fn record_fault(thread: &dyn ThreadContext, fault: &PageFault) {
    thread.set_coredump_property("fault_address", &format!("{:#x}", fault.vaddr().as_usize()));
    thread.set_coredump_property("fault_type", fault_type_name(fault));
    thread.set_coredump_property("fault_access", fault_access_name(fault));
}

fn terminate(
    thread: &dyn ThreadContext,
    fault: &PageFault,
    signal: Signal,
    reason: &'static str,
) -> FaultResolution {
    error!(
        "[PAGEFAULT] {}: {} {} at {} (ip {:#x}), terminating with {}",
        reason,
        fault_type_name(fault),
        fault_access_name(fault),
        fault.vaddr(),
        fault.instruction_pointer(),
        signal
    );
    record_fault(thread, fault);
    FaultResolution::Terminate { signal, reason }
}

/// Decide what to do about `fault`, taken by `thread`.
pub fn dispatch(
    mm: &MemoryManager,
    fault: &PageFault,
    thread: &dyn ThreadContext,
) -> FaultResolution {
    if fault.is_reserved_bit_violation() {
        error!("[PAGEFAULT] reserved bit violation at {}", fault.vaddr());
        return FaultResolution::KernelPanic("Reserved bit violation");
    }

    let cpu = mm.processor().current_cpu();
    if fault.faulted_in_kernel() && mm.processor().in_irq() {
        if let Some(recovery) = mm.landing_pads().lookup(cpu, fault.instruction_pointer()) {
            debug!(
                "[PAGEFAULT] IRQ-context fault at {} recovered at {:#x}",
                fault.vaddr(),
                recovery
            );
            return FaultResolution::RecoverAt(recovery);
        }
    }

    let space = thread.address_space();
    if fault.mode() == ExecutionMode::User {
        let stack_ok = space.as_ref().is_some_and(|space| {
            mm.validate_user_stack(space, VirtAddr::new(fault.stack_pointer()))
        });
        if !stack_ok {
            return terminate(thread, fault, Signal::Segv, "Bad stack on page fault");
        }
    }

    let response = mm.handle_page_fault(space.as_deref(), fault);
    if response == PageFaultResponse::Continue {
        return FaultResolution::Resume;
    }

    if fault.faulted_in_kernel() {
        if let Some(recovery) = mm.landing_pads().lookup(cpu, fault.instruction_pointer()) {
            debug!("[PAGEFAULT] {:?} at {} recovered at {:#x}", response, fault.vaddr(), recovery);
            return FaultResolution::RecoverAt(recovery);
        }
        error!(
            "[PAGEFAULT] unrecoverable {:?} in kernel at {} (ip {:#x})",
            response,
            fault.vaddr(),
            fault.instruction_pointer()
        );
        return FaultResolution::KernelPanic("Unrecoverable page fault in kernel");
    }

    match response {
        PageFaultResponse::OutOfMemory => {
            warn!("[PAGEFAULT] out of memory resolving fault at {}", fault.vaddr());
            terminate(thread, fault, Signal::Kill, "Out of memory")
        }
        PageFaultResponse::BusError => deliver_or_terminate(thread, fault, Signal::Bus, "Bus error"),
        _ => deliver_or_terminate(thread, fault, Signal::Segv, "Page fault"),
    }
}

fn deliver_or_terminate(
    thread: &dyn ThreadContext,
    fault: &PageFault,
    signal: Signal,
    reason: &'static str,
) -> FaultResolution {
    if thread.has_signal_handler(signal) {
        debug!("[PAGEFAULT] delivering {} for fault at {}", signal, fault.vaddr());
        thread.send_urgent_signal_to_self(signal);
        return FaultResolution::SignalDelivered(signal);
    }
    terminate(thread, fault, signal, reason)
}
