//! PantherOS Virtual Memory Core
//!
//! Demand-paged virtual memory for the PantherOS ARM64 kernel.
//!
//! # Components
//! - Physical page pools with reference-counted frames and a shared zero page
//! - VM objects (anonymous, inode-backed shared/private, contiguous)
//! - Regions with per-page copy-on-write and lazy population
//! - Address spaces owning a page directory and a non-overlapping region set
//! - A page-fault dispatcher that turns faults into resume, recover, signal,
//!   terminate or panic decisions
//!
//! # Security Features
//! - User and kernel halves are kept apart in every page directory
//! - Frames are returned to the pool only when the last reference drops
//! - Stale translations are shot down on every CPU before a frame is reused
//!
//! # Architecture
//! - Target: AArch64 (ARM64), 4 KiB granule, 4-level tables
//! - Host builds run the same code against a RAM buffer for testing

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod exception;
pub mod fault;
pub mod mm;

#[cfg(test)]
mod testing;

pub use fault::{
    dispatch, AccessKind, ExecutionMode, FaultKind, FaultResolution, PageFault, PageFaultResponse,
    Signal, ThreadContext,
};
pub use mm::{AddressSpace, MemoryConfig, MemoryManager, VmError};
