//! Orchestration of the memory subsystem: owns the frame allocator, swap
//! manager, TLB, access cache and the process collection, and drives them
//! for the allocate/free/access/switch operations.

use std::collections::BTreeMap;

use crate::constants::memory::{
    CODE_REGION_SIZE, DISK_SIZE, HIGH_WATERMARK, HUGE_PAGE_SIZE, LOW_WATERMARK, MEMORY_SIZE,
    PAGE_SHIFT, PAGE_SIZE, SEGMENT_CACHE_CAPACITY, STACK_REGION_SIZE,
};
use crate::constants::tlb::{L2_CAPACITY, MAX_TLB_PROCESSES};
use crate::memory::access_cache::{CacheMode, CacheStats, SegmentCache, SegmentKey};
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::page_table::Pte;
use crate::memory::swap::{SwapManager, SwapStats};
use crate::memory::tlb::{ReplacementPolicy, Tlb, TlbEntry, TlbLookup, TlbStats};
use crate::memory::MemoryError;
use crate::processes::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Code,
    Stack,
    Heap,
}

impl AccessKind {
    pub fn index(self) -> usize {
        match self {
            AccessKind::Code => 0,
            AccessKind::Stack => 1,
            AccessKind::Heap => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessKind::Code => "code",
            AccessKind::Stack => "stack",
            AccessKind::Heap => "heap",
        }
    }
}

/// Resolved machine geometry for one simulation run.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub memory_size: u64,
    pub disk_size: u64,
    pub high_watermark: u64,
    pub low_watermark: u64,
    pub cache_mode: CacheMode,
    pub policy: ReplacementPolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            memory_size: MEMORY_SIZE,
            disk_size: DISK_SIZE,
            high_watermark: HIGH_WATERMARK,
            low_watermark: LOW_WATERMARK,
            cache_mode: CacheMode::HugePage,
            policy: ReplacementPolicy::Fifo,
        }
    }
}

/// Counters for one run, owned here rather than living as globals so that
/// simulations stay isolated from each other.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimStats {
    /// Total memory access attempts.
    pub accesses: u64,
    /// Page-table reads performed by walks (two per walk).
    pub walk_reads: u64,
    /// TLB misses split by access kind, indexed by [`AccessKind::index`].
    pub kind_misses: [u64; 3],
}

pub struct MemoryManager {
    config: SimConfig,
    frames: FrameAllocator,
    swap: SwapManager,
    tlb: Tlb,
    seg_cache: SegmentCache,
    /// Segment count of every huge page seen by segment-mode accesses.
    segment_counts: BTreeMap<u32, u32>,
    processes: Vec<Process>,
    active: Option<usize>,
    stats: SimStats,
}

impl MemoryManager {
    pub fn new(config: SimConfig) -> Self {
        MemoryManager {
            frames: FrameAllocator::new(config.memory_size),
            swap: SwapManager::new(config.disk_size),
            tlb: Tlb::new(L2_CAPACITY, MAX_TLB_PROCESSES, config.policy),
            seg_cache: SegmentCache::new(config.cache_mode, SEGMENT_CACHE_CAPACITY),
            segment_counts: BTreeMap::new(),
            processes: Vec::new(),
            active: None,
            stats: SimStats::default(),
            config,
        }
    }

    /// Makes `pid` the active process, creating it on first reference.
    /// Every switch starts from an empty L1 context.
    pub fn switch_to(&mut self, pid: u32) -> Result<(), MemoryError> {
        let idx = match self.processes.iter().position(|p| p.pid == pid) {
            Some(idx) => idx,
            None => self.create_process(pid)?,
        };
        self.active = Some(idx);
        self.tlb.flush_l1();
        log::debug!("switched to process {}", pid);
        Ok(())
    }

    /// Maps a fixed code region at the bottom of the address space and a
    /// fixed stack region at the top, both backed by fresh frames, and
    /// registers the process with its heap cursor just above the code.
    fn create_process(&mut self, pid: u32) -> Result<usize, MemoryError> {
        let mut proc = Process::new(pid);

        proc.code_limit = CODE_REGION_SIZE as u32;
        proc.heap = proc.code_limit;
        let mut vpn = 0u32;
        for (pfn, chunk) in self.frames.find_frames(CODE_REGION_SIZE)? {
            proc.page_table.map(chunk as u32, vpn, pfn);
            vpn += (chunk / PAGE_SIZE) as u32;
        }

        proc.stack_base = (u32::MAX - STACK_REGION_SIZE as u32) + 1;
        let mut vpn = proc.stack_base >> PAGE_SHIFT;
        for (pfn, chunk) in self.frames.find_frames(STACK_REGION_SIZE)? {
            proc.page_table.map(chunk as u32, vpn, pfn);
            vpn += (chunk / PAGE_SIZE) as u32;
        }

        log::info!("created process {}", pid);
        self.processes.push(proc);
        Ok(self.processes.len() - 1)
    }

    /// Allocates `size` bytes (rounded up to a power-of-two multiple of the
    /// page size) at the active process's heap cursor. Crossing the low
    /// watermark first swaps out enough pages to restore the high one.
    /// Returns the virtual base address of the allocation.
    pub fn allocate(&mut self, size: u64) -> Result<u32, MemoryError> {
        let idx = self.active_index()?;
        let size = size.max(PAGE_SIZE).next_power_of_two();

        let projected = self.frames.free_bytes().saturating_sub(size);
        if projected < self.config.low_watermark {
            let target = self.config.high_watermark.saturating_sub(projected);
            let freed = self.swap.swap_out_to_watermark(
                target,
                &mut self.processes,
                &mut self.frames,
                &mut self.tlb,
            )?;
            log::debug!(
                "low watermark crossed: requested {} bytes of swap, freed {}",
                target,
                freed
            );
        }

        let chunks = self.frames.find_frames(size)?;
        let proc = &mut self.processes[idx];
        let base = proc.heap;
        let mut vpn = base >> PAGE_SHIFT;
        for (pfn, chunk) in chunks {
            proc.page_table.map(chunk as u32, vpn, pfn);
            vpn += (chunk / PAGE_SIZE) as u32;
        }
        proc.grow_heap(size);
        Ok(base)
    }

    /// Frees every heap page from `base_address` up to the active process's
    /// heap cursor and retreats the cursor to `base_address`. The boundary
    /// must lie inside the live heap range.
    pub fn free(&mut self, base_address: u32) -> Result<u64, MemoryError> {
        let idx = self.active_index()?;
        let (pid, heap_top, code_limit) = {
            let proc = &self.processes[idx];
            (proc.pid, proc.heap, proc.code_limit)
        };
        if base_address < code_limit || base_address > heap_top {
            return Err(MemoryError::InvalidMapping);
        }

        let mut addr = base_address as u64;
        let end = heap_top as u64;
        let mut freed = 0u64;
        while addr < end {
            match self.processes[idx].page_table.entry((addr >> PAGE_SHIFT) as u32) {
                Some(pte) => {
                    self.processes[idx].page_table.unmap(pte.vpn);
                    if pte.present {
                        self.frames
                            .free_range(pte.pfn, (pte.page_size as u64 / PAGE_SIZE) as usize);
                    } else {
                        // page lives on disk; release its block instead
                        self.swap.discard(pid, pte.vpn);
                    }
                    self.tlb.invalidate(pid, pte.vpn);
                    freed += pte.page_size as u64;
                    addr = ((pte.vpn as u64) << PAGE_SHIFT) + pte.page_size as u64;
                }
                None => addr += PAGE_SIZE,
            }
        }

        self.processes[idx].shrink_heap(base_address, freed);
        Ok(freed)
    }

    /// One memory access: translate (handling a page fault by swapping the
    /// page back in and retrying), feed the segment cache for huge pages,
    /// then consult the TLB, refilling both levels on a miss. Returns the
    /// physical address.
    pub fn access(&mut self, vaddr: u32, kind: AccessKind) -> Result<u64, MemoryError> {
        let idx = self.active_index()?;
        self.stats.accesses += 1;
        let pid = self.processes[idx].pid;

        let pte = self.resolve(idx, vaddr)?;
        self.update_access_cache(idx, &pte, vaddr);

        match self.tlb.lookup(vaddr, pid) {
            TlbLookup::Hit(entry) => Ok(Tlb::assemble_physical_addr(&entry, vaddr)),
            TlbLookup::Miss => {
                self.stats.kind_misses[kind.index()] += 1;
                let entry = TlbEntry::new(pte.pfn, pte.page_size, vaddr, pid);
                self.tlb.insert_l1(entry);
                self.tlb.insert_l2(entry);
                // the refill is expected to hit; confirm without counting
                // the same access twice
                let refilled = self.tlb.probe(vaddr, pid).unwrap_or(entry);
                Ok(Tlb::assemble_physical_addr(&refilled, vaddr))
            }
        }
    }

    /// Page-table walk with synchronous fault handling: a non-resident page
    /// is swapped back in and the walk retried once.
    fn resolve(&mut self, idx: usize, vaddr: u32) -> Result<Pte, MemoryError> {
        self.stats.walk_reads += 2;
        match self.processes[idx].page_table.translate(vaddr) {
            Ok(pte) => Ok(pte),
            Err(MemoryError::PageFault) => {
                let proc = &mut self.processes[idx];
                let stale = proc
                    .page_table
                    .entry(vaddr >> PAGE_SHIFT)
                    .ok_or(MemoryError::InvalidMapping)?;
                self.swap.swap_in(
                    proc.pid,
                    stale.vpn,
                    stale.page_size,
                    &mut self.frames,
                    &mut proc.page_table,
                )?;
                self.stats.walk_reads += 2;
                self.processes[idx].page_table.translate(vaddr)
            }
            Err(e) => Err(e),
        }
    }

    fn update_access_cache(&mut self, idx: usize, pte: &Pte, vaddr: u32) {
        if pte.page_size < HUGE_PAGE_SIZE {
            return;
        }
        let segments = (pte.page_size as u64 / PAGE_SIZE) as u32;
        match self.seg_cache.mode() {
            CacheMode::HugePage => {
                // a page with more segments than the cache could ever hold
                // is not admitted at all
                if segments as usize <= self.seg_cache.capacity() {
                    self.seg_cache.touch(SegmentKey::HugePage(pte.pfn));
                } else {
                    self.seg_cache.record_miss();
                }
            }
            CacheMode::Segment => {
                let offset =
                    ((vaddr as u64 - ((pte.vpn as u64) << PAGE_SHIFT)) / PAGE_SIZE) as u32;
                self.seg_cache.touch(SegmentKey::Segment(pte.pfn, offset));
                self.segment_counts.insert(pte.pfn, segments);
                self.processes[idx].record_segment_access(pte.pfn, offset);
            }
        }
    }

    fn active_index(&self) -> Result<usize, MemoryError> {
        self.active.ok_or(MemoryError::NoProcess)
    }

    pub fn active_pid(&self) -> Option<u32> {
        self.active.map(|idx| self.processes[idx].pid)
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn free_bytes(&self) -> u64 {
        self.frames.free_bytes()
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.seg_cache.mode()
    }

    pub fn segment_counts(&self) -> &BTreeMap<u32, u32> {
        &self.segment_counts
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn tlb_stats(&self) -> TlbStats {
        self.tlb.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.seg_cache.stats()
    }

    pub fn swap_stats(&self) -> SwapStats {
        self.swap.stats()
    }

    #[cfg(test)]
    fn swap(&self) -> &SwapManager {
        &self.swap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn config(memory_mb: u64) -> SimConfig {
        SimConfig {
            memory_size: memory_mb * MB,
            disk_size: 16 * MB,
            // watermarks at zero: swapping never triggers unless asked for
            high_watermark: 0,
            low_watermark: 0,
            ..SimConfig::default()
        }
    }

    fn manager(memory_mb: u64) -> MemoryManager {
        MemoryManager::new(config(memory_mb))
    }

    #[test]
    fn switch_creates_the_process_once() {
        let mut mm = manager(32);
        mm.switch_to(7).unwrap();
        mm.switch_to(7).unwrap();

        assert_eq!(mm.processes().len(), 1);
        assert_eq!(mm.active_pid(), Some(7));

        let proc = &mm.processes()[0];
        assert_eq!(proc.code_limit, CODE_REGION_SIZE as u32);
        assert_eq!(proc.heap, proc.code_limit);
        assert_eq!(proc.stack_base, 0xFFC0_0000);
        assert!(proc.page_table.translate(0).unwrap().present);
        assert!(proc.page_table.translate(0xFFFF_F000).unwrap().present);
    }

    #[test]
    fn operations_without_a_process_are_rejected() {
        let mut mm = manager(32);
        assert_eq!(mm.allocate(4096).unwrap_err(), MemoryError::NoProcess);
        assert_eq!(mm.free(0).unwrap_err(), MemoryError::NoProcess);
        assert_eq!(
            mm.access(0, AccessKind::Code).unwrap_err(),
            MemoryError::NoProcess
        );
    }

    #[test]
    fn allocate_maps_at_the_heap_cursor() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();
        let free_before = mm.free_bytes();

        let base = mm.allocate(16384).unwrap();
        assert_eq!(base, CODE_REGION_SIZE as u32);

        let proc = &mm.processes()[0];
        assert_eq!(proc.heap, base + 16384);
        assert_eq!(proc.size, 16384);
        let pte = proc.page_table.translate(base).unwrap();
        assert_eq!(pte.vpn, base >> PAGE_SHIFT);
        assert_eq!(mm.free_bytes(), free_before - 16384);
    }

    #[test]
    fn allocate_rounds_up_to_a_power_of_two() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();

        let base = mm.allocate(0x3000).unwrap();
        assert_eq!(mm.processes()[0].heap, base + 0x4000);
    }

    #[test]
    fn free_releases_everything_above_the_boundary() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();
        let free_before = mm.free_bytes();

        let first = mm.allocate(16384).unwrap();
        let second = mm.allocate(8192).unwrap();

        let freed = mm.free(second).unwrap();
        assert_eq!(freed, 8192);
        assert_eq!(mm.processes()[0].heap, second);

        let freed = mm.free(first).unwrap();
        assert_eq!(freed, 16384);
        assert_eq!(mm.processes()[0].heap, first);
        assert_eq!(mm.free_bytes(), free_before);
        assert_eq!(
            mm.processes()[0].page_table.translate(first).unwrap_err(),
            MemoryError::InvalidMapping
        );
    }

    #[test]
    fn free_outside_the_heap_range_is_rejected() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();
        mm.allocate(4096).unwrap();

        assert_eq!(mm.free(0).unwrap_err(), MemoryError::InvalidMapping);
        let past_heap = mm.processes()[0].heap + 4096;
        assert_eq!(mm.free(past_heap).unwrap_err(), MemoryError::InvalidMapping);
    }

    #[test]
    fn access_counts_attempts_and_kind_misses() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();

        mm.access(0x100, AccessKind::Code).unwrap();
        mm.access(0x104, AccessKind::Code).unwrap();

        let stats = mm.stats();
        assert_eq!(stats.accesses, 2);
        // first access misses and refills; second hits L1
        assert_eq!(stats.kind_misses[AccessKind::Code.index()], 1);
        assert_eq!(mm.tlb_stats().l1_hits, 1);
        assert_eq!(stats.walk_reads, 4);
    }

    #[test]
    fn access_to_an_unmapped_address_fails() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();

        let unmapped = 0x2000_0000;
        assert_eq!(
            mm.access(unmapped, AccessKind::Heap).unwrap_err(),
            MemoryError::InvalidMapping
        );
        assert_eq!(mm.stats().accesses, 1);
    }

    #[test]
    fn switching_processes_flushes_the_l1_context() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();
        mm.access(0x100, AccessKind::Code).unwrap();

        // re-activating the same process still starts with an empty L1
        mm.switch_to(2).unwrap();
        mm.switch_to(1).unwrap();
        mm.access(0x100, AccessKind::Code).unwrap();

        // the second access was served from L2, not L1
        assert_eq!(mm.tlb_stats().l1_hits, 0);
        assert_eq!(mm.tlb_stats().l2_hits, 1);
    }

    #[test]
    fn crossing_the_low_watermark_swaps_out_until_the_high_one() {
        let mut mm = MemoryManager::new(SimConfig {
            memory_size: 16 * MB,
            disk_size: 16 * MB,
            high_watermark: 6 * MB,
            low_watermark: 5 * MB,
            ..SimConfig::default()
        });
        mm.switch_to(1).unwrap();
        assert_eq!(mm.free_bytes(), 8 * MB);

        // projected free of 4 MiB crosses the 5 MiB low watermark; the
        // sweep must free one 4 MiB page to reach the 6 MiB high watermark
        mm.allocate(4 * MB).unwrap();

        assert_eq!(mm.swap_stats().pages_out, 1);
        assert_eq!(mm.swap_stats().bytes_out, 4 * MB);
        assert_eq!(mm.free_bytes(), 8 * MB);
        // the victim was the code page, now on disk
        let proc = &mm.processes()[0];
        assert!(!proc.page_table.entry(0).unwrap().present);
        assert_eq!(mm.swap().block_of(1, 0), Some(0));
    }

    #[test]
    fn page_fault_swaps_the_page_back_in_and_retries() {
        let mut mm = MemoryManager::new(SimConfig {
            memory_size: 16 * MB,
            disk_size: 16 * MB,
            high_watermark: 6 * MB,
            low_watermark: 5 * MB,
            ..SimConfig::default()
        });
        mm.switch_to(1).unwrap();
        mm.allocate(4 * MB).unwrap(); // swaps the code page out

        // code access faults, swaps back in, and completes
        mm.access(0x100, AccessKind::Code).unwrap();

        assert_eq!(mm.swap_stats().pages_in, 1);
        let proc = &mm.processes()[0];
        assert!(proc.page_table.translate(0x100).unwrap().present);
        assert_eq!(mm.swap().block_of(1, 0), None);
    }

    #[test]
    fn oversized_huge_pages_never_enter_the_cache() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();

        // the 4 MiB code page has 1024 segments, above the 512 capacity
        mm.access(0x100, AccessKind::Code).unwrap();

        assert_eq!(mm.cache_stats().misses, 1);
        assert_eq!(mm.cache_stats().hits, 0);
    }

    #[test]
    fn admissible_huge_pages_hit_on_reaccess() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();

        // 512 KiB: exactly the huge-page threshold, 128 segments
        let base = mm.allocate(HUGE_PAGE_SIZE as u64).unwrap();
        mm.access(base, AccessKind::Heap).unwrap();
        mm.access(base + 0x2000, AccessKind::Heap).unwrap();

        assert_eq!(mm.cache_stats().misses, 1);
        assert_eq!(mm.cache_stats().hits, 1);
    }

    #[test]
    fn small_pages_bypass_the_cache() {
        let mut mm = manager(32);
        mm.switch_to(1).unwrap();

        let base = mm.allocate(4096).unwrap();
        mm.access(base, AccessKind::Heap).unwrap();

        assert_eq!(mm.cache_stats().hits + mm.cache_stats().misses, 0);
    }

    #[test]
    fn segment_mode_histogram_counts_per_offset() {
        let mut mm = MemoryManager::new(SimConfig {
            cache_mode: CacheMode::Segment,
            ..config(32)
        });
        mm.switch_to(1).unwrap();

        let base = mm.allocate(HUGE_PAGE_SIZE as u64).unwrap();
        let offset = 3 * PAGE_SIZE as u32;
        mm.access(base + offset, AccessKind::Heap).unwrap();
        mm.access(base + offset + 0x10, AccessKind::Heap).unwrap();

        let proc = &mm.processes()[0];
        let pfn = proc.page_table.translate(base).unwrap().pfn;
        assert_eq!(proc.segment_accesses[&pfn][&3], 2);
        assert_eq!(mm.segment_counts()[&pfn], 128);
        assert_eq!(mm.cache_stats().hits, 1);
        assert_eq!(mm.cache_stats().misses, 1);
    }
}
