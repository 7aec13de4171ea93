//! The file-system side of inode-backed memory.

use alloc::vec::Vec;
use core::fmt;

/// Identifies an inode across the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub u64);

/// Why an inode page could not be read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeError {
    /// The device reported an error.
    Io,
    /// The page lies entirely past the end of the file.
    BeyondEnd,
}

impl fmt::Display for InodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => write!(f, "I/O error"),
            Self::BeyondEnd => write!(f, "page beyond end of file"),
        }
    }
}

/// What paging needs from a file.
///
/// Calls may block on I/O; they are never made with a VMObject slot lock
/// or a quickmap slot held.
pub trait Inode: Send + Sync {
    fn id(&self) -> InodeId;

    /// File size in bytes.
    fn size(&self) -> usize;

    /// Read page `page_index`. A short read (at end of file) returns fewer
    /// than `PAGE_SIZE` bytes; the rest of the frame is zero-filled.
    fn read_page(&self, page_index: usize) -> Result<Vec<u8>, InodeError>;

    /// Write a dirty page back. Bytes past the end of the file are dropped.
    fn write_back(&self, page_index: usize, bytes: &[u8]) -> Result<(), InodeError>;
}
