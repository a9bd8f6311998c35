/// Minimum page size in bytes. Every larger page is a power-of-two multiple.
pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Intra-page offset bits at the minimum page size.
pub const PAGE_SHIFT: u32 = 12;

/// Index width of each page-table level (10/10/12 split of a 32-bit address).
pub const LEVEL_BITS: u32 = 10;
pub const LEVEL_ENTRIES: usize = 1 << LEVEL_BITS;
pub const LEVEL_MASK: u32 = (LEVEL_ENTRIES as u32) - 1;

// Default machine geometry; all overridable on the command line.
pub const MEMORY_SIZE: u64 = 1 << 32;
pub const DISK_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const HIGH_WATERMARK: u64 = 200 * 1024 * 1024;
pub const LOW_WATERMARK: u64 = 100 * 1024 * 1024;

/// Fixed code and stack regions mapped at process creation.
pub const CODE_REGION_SIZE: u64 = 4096 * 1024;
pub const STACK_REGION_SIZE: u64 = 4096 * 1024;

/// Pages at least this large feed the access segment cache.
pub const HUGE_PAGE_SIZE: u32 = 128 * 4096;

/// Capacity of the access segment cache, in entries.
pub const SEGMENT_CACHE_CAPACITY: usize = 512;

pub const BITMAP_ENTRY_SIZE: usize = 64;
