//! Simulated swap device: a bitmap of disk blocks plus the map recording
//! which block holds each swapped-out page. No payload moves; swapping is
//! bookkeeping over the frame bitmap, the page table and the disk map.

use std::collections::BTreeMap;

use crate::constants::memory::PAGE_SIZE;
use crate::memory::bitmap::Bitmap;
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::page_table::TwoLevelPageTable;
use crate::memory::tlb::Tlb;
use crate::memory::MemoryError;
use crate::processes::Process;

#[derive(Debug, Default, Clone, Copy)]
pub struct SwapStats {
    pub pages_out: u64,
    pub pages_in: u64,
    pub bytes_out: u64,
}

pub struct SwapManager {
    disk: Bitmap,
    /// (pid, vpn) of a swapped-out page to the disk block holding it.
    page_to_block: BTreeMap<(u32, u32), u32>,
    stats: SwapStats,
}

impl SwapManager {
    pub fn new(disk_size: u64) -> Self {
        SwapManager {
            disk: Bitmap::new((disk_size / PAGE_SIZE) as usize),
            page_to_block: BTreeMap::new(),
            stats: SwapStats::default(),
        }
    }

    pub fn find_free_block(&self) -> Option<u32> {
        self.disk.find_first_clear().map(|i| i as u32)
    }

    pub fn block_of(&self, pid: u32, vpn: u32) -> Option<u32> {
        self.page_to_block.get(&(pid, vpn)).copied()
    }

    /// Evicts one resident page to disk: reserves a block, records the
    /// page's location, clears every frame bit the page held and clears its
    /// present bits. Returns the bytes freed; a page whose frame is already
    /// free is a no-op returning zero.
    pub fn swap_out(
        &mut self,
        pid: u32,
        vpn: u32,
        pfn: u32,
        page_size: u32,
        frames: &mut FrameAllocator,
        table: &mut TwoLevelPageTable,
    ) -> Result<u64, MemoryError> {
        if !frames.is_frame_used(pfn) {
            return Ok(0);
        }

        let block = self.find_free_block().ok_or(MemoryError::OutOfDiskSpace)?;
        self.disk.set(block as usize);
        self.page_to_block.insert((pid, vpn), block);
        frames.free_range(pfn, (page_size as u64 / PAGE_SIZE) as usize);
        table.clear_present(vpn);

        self.stats.pages_out += 1;
        self.stats.bytes_out += page_size as u64;
        log::debug!(
            "swapped out pid {} vpn {:#x} ({} bytes) to disk block {}",
            pid,
            vpn,
            page_size,
            block
        );
        Ok(page_size as u64)
    }

    /// Brings a swapped-out page back: releases its disk block, allocates
    /// fresh frames of `page_size` (possibly split into smaller chunks) and
    /// remaps the page table starting at `vpn`.
    pub fn swap_in(
        &mut self,
        pid: u32,
        vpn: u32,
        page_size: u32,
        frames: &mut FrameAllocator,
        table: &mut TwoLevelPageTable,
    ) -> Result<(), MemoryError> {
        let block = self
            .page_to_block
            .remove(&(pid, vpn))
            .ok_or(MemoryError::InvalidMapping)?;
        self.disk.clear(block as usize);

        let chunks = frames.find_frames(page_size as u64)?;
        let mut cursor = vpn;
        for (pfn, chunk_size) in chunks {
            table.map(chunk_size as u32, cursor, pfn);
            cursor += (chunk_size / PAGE_SIZE) as u32;
        }

        self.stats.pages_in += 1;
        log::debug!("swapped in pid {} vpn {:#x} from disk block {}", pid, vpn, block);
        Ok(())
    }

    /// Releases the disk block of a swapped-out page that is being freed
    /// rather than brought back.
    pub fn discard(&mut self, pid: u32, vpn: u32) -> Option<u32> {
        let block = self.page_to_block.remove(&(pid, vpn))?;
        self.disk.clear(block as usize);
        Some(block)
    }

    /// Walks every process's pages from the code-region start to its heap
    /// cursor, swapping out resident pages and invalidating their TLB
    /// entries until `target` bytes are freed or the ranges run out.
    /// Returns the bytes actually freed.
    pub fn swap_out_to_watermark(
        &mut self,
        target: u64,
        processes: &mut [Process],
        frames: &mut FrameAllocator,
        tlb: &mut Tlb,
    ) -> Result<u64, MemoryError> {
        let mut freed = 0u64;

        for proc in processes.iter_mut() {
            if freed >= target {
                break;
            }

            let mut addr = 0u64;
            let end = proc.heap as u64;
            while addr < end && freed < target {
                match proc.page_table.entry((addr >> 12) as u32) {
                    Some(pte) if pte.present => {
                        freed += self.swap_out(
                            proc.pid,
                            pte.vpn,
                            pte.pfn,
                            pte.page_size,
                            frames,
                            &mut proc.page_table,
                        )?;
                        tlb.invalidate(proc.pid, pte.vpn);
                        addr = ((pte.vpn as u64) << 12) + pte.page_size as u64;
                    }
                    // already on disk; skip the whole page
                    Some(pte) => addr = ((pte.vpn as u64) << 12) + pte.page_size as u64,
                    None => addr += PAGE_SIZE,
                }
            }
        }

        Ok(freed)
    }

    pub fn stats(&self) -> SwapStats {
        self.stats
    }

    pub fn free_blocks(&self) -> usize {
        self.disk.free()
    }
}
