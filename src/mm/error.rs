//! Error type for memory-management operations.

/// Error type for mapping and allocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical frames (or kernel heap) available.
    OutOfMemory,
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The virtual address is not mapped.
    NotMapped,
    /// The address or size is not properly aligned.
    MisalignedAddress,
    /// Attempted to map kernel address with user flags, or the reverse.
    InvalidPermissions,
    /// The requested range overlaps an existing region.
    RangeOverlap,
    /// No free virtual range large enough.
    OutOfRange,
    /// Zero-sized or overflowing request.
    InvalidSize,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::InvalidPermissions => write!(f, "invalid permission combination"),
            Self::RangeOverlap => write!(f, "range overlaps an existing region"),
            Self::OutOfRange => write!(f, "no free virtual range"),
            Self::InvalidSize => write!(f, "invalid size"),
        }
    }
}
