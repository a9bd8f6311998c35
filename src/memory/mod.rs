//! Virtual-memory machinery: page tables, TLB, frame allocator, swap and
//! the access segment cache, orchestrated by [`manager::MemoryManager`].

use core::fmt;

pub mod access_cache;
pub mod bitmap;
pub mod frame_allocator;
pub mod manager;
pub mod page_table;
pub mod swap;
pub mod tlb;

pub use manager::{AccessKind, MemoryManager, SimConfig};

/// Errors surfaced by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Translation of a virtual page that was never mapped.
    InvalidMapping,
    /// Translation of a page that is mapped but currently swapped out.
    /// Handled by a synchronous swap-in and a retried translation.
    PageFault,
    /// The frame allocator cannot satisfy a request even at minimum size.
    OutOfMemory,
    /// No free disk block is left for a swap-out.
    OutOfDiskSpace,
    /// An instruction was dispatched before any process was switched in.
    NoProcess,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InvalidMapping => write!(f, "virtual page was never mapped"),
            MemoryError::PageFault => write!(f, "page is mapped but not resident"),
            MemoryError::OutOfMemory => write!(f, "not enough memory to allocate"),
            MemoryError::OutOfDiskSpace => write!(f, "no free disk block found for swapping"),
            MemoryError::NoProcess => write!(f, "no active process"),
        }
    }
}

impl std::error::Error for MemoryError {}
