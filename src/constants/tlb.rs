/// L1 holds the active process context only and is flushed on every switch.
pub const L1_CAPACITY: usize = 64;

/// Total L2 entries, split evenly across the per-process buckets.
pub const L2_CAPACITY: usize = 1024;

/// Maximum number of processes resident in L2 at once.
pub const MAX_TLB_PROCESSES: usize = 4;

/// Seed for the Random replacement policy, fixed so runs are reproducible.
pub const TLB_RNG_SEED: u64 = 0x7a05_1e55;
