//! Frequency-based cache over the hot sub-regions of huge pages.
//!
//! Two mutually exclusive granularities, fixed at construction: whole huge
//! pages, or 4 KiB segments within them. Eviction is least-frequently-used
//! with no decay, so a long-cold but once-popular key can hold its slot
//! indefinitely.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentKey {
    /// Base frame of a whole huge page.
    HugePage(u32),
    /// Base frame plus the 4 KiB segment offset inside the page.
    Segment(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    HugePage,
    Segment,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

pub struct SegmentCache {
    mode: CacheMode,
    capacity: usize,
    entries: BTreeMap<SegmentKey, u32>,
    stats: CacheStats,
}

impl SegmentCache {
    pub fn new(mode: CacheMode, capacity: usize) -> Self {
        assert!(capacity > 0);
        SegmentCache {
            mode,
            capacity,
            entries: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records an access to `key`. A hit bumps the key's frequency; a miss
    /// inserts it at frequency 1, first evicting some minimum-frequency
    /// entry when the cache is full. Returns whether the access hit.
    pub fn touch(&mut self, key: SegmentKey) -> bool {
        if let Some(freq) = self.entries.get_mut(&key) {
            *freq += 1;
            self.stats.hits += 1;
            return true;
        }

        self.stats.misses += 1;
        if self.entries.len() >= self.capacity {
            self.evict_least_frequent();
        }
        self.entries.insert(key, 1);
        false
    }

    /// Counts an access that is not admitted at all (a huge page with more
    /// segments than the cache could hold).
    pub fn record_miss(&mut self) {
        self.stats.misses += 1;
    }

    pub fn frequency(&self, key: &SegmentKey) -> Option<u32> {
        self.entries.get(key).copied()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn evict_least_frequent(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, freq)| **freq)
            .map(|(key, _)| *key);
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
