//! Two-level software-managed translation cache.
//!
//! L1 is a small fully-associative list holding the active process context;
//! it is flushed on every switch. L2 is sharded into per-process buckets
//! that survive switches. A bucket belongs to the process that most
//! recently inserted into it.

use arrayvec::ArrayVec;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::constants::tlb::{L1_CAPACITY, TLB_RNG_SEED};

/// Cached copy of a page-table entry. Never authoritative; the page table
/// wins whenever the two disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub pid: u32,
    pub page_size: u32,
    pub vpn: u32,
    pub pfn: u32,
    pub reference: u32,
}

impl TlbEntry {
    pub fn new(pfn: u32, page_size: u32, vaddr: u32, pid: u32) -> Self {
        TlbEntry {
            pid,
            page_size,
            vpn: page_vpn(vaddr, page_size),
            pfn,
            reference: 1,
        }
    }
}

/// Virtual page number of the page covering `vaddr`, expressed in 4 KiB
/// units: mask off the intra-page offset for this entry's page size.
fn page_vpn(vaddr: u32, page_size: u32) -> u32 {
    (vaddr & !(page_size - 1)) >> 12
}

/// Result of a TLB probe. A miss is a control signal, not an error: the
/// caller re-resolves through the page table and refills both levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbLookup {
    Hit(TlbEntry),
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Random,
    Fifo,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TlbStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
}

pub struct Tlb {
    l1: ArrayVec<TlbEntry, L1_CAPACITY>,
    l2: Vec<Vec<TlbEntry>>,
    l2_per_process: usize,
    max_processes: usize,
    policy: ReplacementPolicy,
    rng: SmallRng,
    stats: TlbStats,
}

impl Tlb {
    pub fn new(l2_size: usize, max_processes: usize, policy: ReplacementPolicy) -> Self {
        assert!(max_processes > 0 && l2_size >= max_processes);
        let l2 = (0..max_processes).map(|_| Vec::new()).collect();
        log::debug!(
            "TLB initialized: l1 {}, l2 {} across {} buckets, {:?} replacement",
            L1_CAPACITY,
            l2_size,
            max_processes,
            policy
        );
        Tlb {
            l1: ArrayVec::new(),
            l2,
            l2_per_process: l2_size / max_processes,
            max_processes,
            policy,
            rng: SmallRng::seed_from_u64(TLB_RNG_SEED),
            stats: TlbStats::default(),
        }
    }

    /// Looks `vaddr` up in L1, then in the L2 bucket owned by `pid`. An L2
    /// hit promotes the entry into L1.
    pub fn lookup(&mut self, vaddr: u32, pid: u32) -> TlbLookup {
        if let Some(entry) = self.probe_l1(vaddr) {
            self.stats.l1_hits += 1;
            return TlbLookup::Hit(entry);
        }
        if let Some(entry) = self.probe_l2(vaddr, pid) {
            self.insert_l1(entry);
            self.stats.l2_hits += 1;
            return TlbLookup::Hit(entry);
        }
        self.stats.misses += 1;
        TlbLookup::Miss
    }

    /// Uncounted probe of both levels, with no promotion. Used to confirm a
    /// refill without tallying the expected hit twice.
    pub fn probe(&self, vaddr: u32, pid: u32) -> Option<TlbEntry> {
        self.probe_l1(vaddr).or_else(|| self.probe_l2(vaddr, pid))
    }

    fn probe_l1(&self, vaddr: u32) -> Option<TlbEntry> {
        // L1 holds only the active context, so entries match on vpn alone,
        // each recomputing the vpn under its own page size.
        self.l1
            .iter()
            .find(|e| page_vpn(vaddr, e.page_size) == e.vpn)
            .copied()
    }

    fn probe_l2(&self, vaddr: u32, pid: u32) -> Option<TlbEntry> {
        let bucket = self.bucket_of(pid)?;
        self.l2[bucket]
            .iter()
            .find(|e| page_vpn(vaddr, e.page_size) == e.vpn)
            .copied()
    }

    /// Index of the bucket currently owned by `pid`, keyed by the pid of
    /// each bucket's most recent occupant.
    fn bucket_of(&self, pid: u32) -> Option<usize> {
        self.l2
            .iter()
            .position(|b| b.last().map(|e| e.pid) == Some(pid))
    }

    pub fn insert_l1(&mut self, entry: TlbEntry) {
        if self.l1.len() < self.l1.capacity() {
            self.l1.push(entry);
            return;
        }
        match self.policy {
            ReplacementPolicy::Random => {
                let victim = self.rng.gen_range(0..self.l1.len());
                self.l1[victim] = entry;
            }
            ReplacementPolicy::Fifo => {
                self.l1.remove(0);
                self.l1.push(entry);
            }
        }
    }

    pub fn insert_l2(&mut self, entry: TlbEntry) {
        let bucket = match self.bucket_of(entry.pid) {
            Some(owned) => owned,
            None => match self.l2.iter().position(|b| b.is_empty()) {
                Some(empty) => empty,
                // All buckets taken: reclaim one for the new process.
                None => match self.policy {
                    ReplacementPolicy::Random => {
                        let victim = self.rng.gen_range(0..self.max_processes);
                        self.l2[victim].clear();
                        victim
                    }
                    ReplacementPolicy::Fifo => {
                        self.l2.remove(0);
                        self.l2.push(Vec::new());
                        self.l2.len() - 1
                    }
                },
            },
        };

        if self.l2[bucket].len() == self.l2_per_process {
            match self.policy {
                ReplacementPolicy::Random => {
                    let victim = self.rng.gen_range(0..self.l2_per_process);
                    self.l2[bucket][victim] = entry;
                }
                ReplacementPolicy::Fifo => {
                    self.l2[bucket].remove(0);
                    self.l2[bucket].push(entry);
                }
            }
        } else {
            self.l2[bucket].push(entry);
        }
    }

    /// Drops every entry matching `(pid, vpn)` exactly, in both levels.
    /// Scans everything: a process's entries are not contiguous.
    pub fn invalidate(&mut self, pid: u32, vpn: u32) {
        self.l1.retain(|e| !(e.pid == pid && e.vpn == vpn));
        for bucket in &mut self.l2 {
            bucket.retain(|e| !(e.pid == pid && e.vpn == vpn));
        }
    }

    /// Empties L1. Invoked on every process switch.
    pub fn flush_l1(&mut self) {
        self.l1.clear();
    }

    /// Physical address for a hit: the frame number shifted by this page
    /// size's offset width, orred with the intra-page offset.
    pub fn assemble_physical_addr(entry: &TlbEntry, vaddr: u32) -> u64 {
        let offset_len = entry.page_size.trailing_zeros();
        let offset = vaddr & (entry.page_size - 1);
        ((entry.pfn as u64) << offset_len) | offset as u64
    }

    pub fn stats(&self) -> TlbStats {
        self.stats
    }

    #[cfg(test)]
    fn l1_len(&self) -> usize {
        self.l1.len()
    }

    #[cfg(test)]
    fn l2_bucket(&self, idx: usize) -> &[TlbEntry] {
        &self.l2[idx]
    }
}
