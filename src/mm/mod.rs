//! Memory management for PantherOS
//!
//! Provides:
//! - Physical page pools and the physical memory window
//! - ARM64 page tables and per-address-space page directories
//! - VM objects, regions and address spaces
//! - Fault resolution, user memory access and the kernel heap
//!
//! # Security Principles
//! - All allocations are bounds-checked
//! - Memory handed to user mode is always initialized
//! - Unsafe code is confined to the physical window and the quickmap

pub mod address;
pub mod address_space;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod frame;
pub mod heap;
pub mod inode;
pub mod manager;
pub mod page_directory;
pub mod paging;
pub mod physical;
pub mod quickmap;
pub mod region;
pub mod registry;
pub mod user;
pub mod vmobject;

pub use address::{PhysAddr, VirtAddr, VirtualRange, PAGE_SIZE};
pub use address_space::{AddressSpace, Placement, RegionInfo};
pub use config::MemoryConfig;
pub use error::VmError;
pub use frame::{PhysicalPage, PhysicalPageAllocator, ShouldZeroFill, SystemMemoryInfo};
pub use heap::KernelHeap;
pub use inode::{Inode, InodeError, InodeId};
pub use manager::{FaultCounters, KernelRegion, MemoryManager};
pub use region::{Access, Region, RegionFlags};
pub use user::{FaultOccurred, UserCopyError};
pub use vmobject::{VmObject, VmObjectKind};
