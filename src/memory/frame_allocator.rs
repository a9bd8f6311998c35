use crate::constants::memory::{FRAME_SIZE, PAGE_SIZE};
use crate::memory::bitmap::Bitmap;
use crate::memory::MemoryError;

/// Bitmap allocator over the physical frame space.
///
/// Requests larger than one frame are served by the first naturally aligned
/// run of free frames; when no such run exists the request is split into two
/// half-size chunks (best effort, never coalesced back).
pub struct FrameAllocator {
    frames: Bitmap,
}

impl FrameAllocator {
    pub fn new(memory_size: u64) -> Self {
        FrameAllocator {
            frames: Bitmap::new((memory_size / PAGE_SIZE) as usize),
        }
    }

    /// Allocates `size` bytes of physical frames, returned as one or more
    /// `(base_pfn, chunk_size)` chunks. `size` must be a power-of-two
    /// multiple of the frame size.
    pub fn find_frames(&mut self, size: u64) -> Result<Vec<(u32, u64)>, MemoryError> {
        debug_assert!(size >= PAGE_SIZE && size.is_power_of_two());

        let run = (size / PAGE_SIZE) as usize;
        if let Some(start) = self.frames.find_aligned_clear_run(run) {
            for frame in start..start + run {
                self.frames.set(frame);
            }
            return Ok(vec![(start as u32, size)]);
        }

        if size == PAGE_SIZE {
            return Err(MemoryError::OutOfMemory);
        }

        // No aligned run of this size: split into two half-size requests.
        let mut chunks = self.find_frames(size / 2)?;
        match self.find_frames(size / 2) {
            Ok(more) => {
                chunks.extend(more);
                Ok(chunks)
            }
            Err(e) => {
                // Roll the first half back so no frame stays marked for a
                // failed allocation.
                for (pfn, chunk_size) in &chunks {
                    self.free_range(*pfn, (chunk_size / PAGE_SIZE) as usize);
                }
                Err(e)
            }
        }
    }

    /// First free frame, if any.
    pub fn find_free_frame(&self) -> Option<u32> {
        self.frames.find_first_clear().map(|i| i as u32)
    }

    /// Clears `count` frame bits starting at `pfn`.
    pub fn free_range(&mut self, pfn: u32, count: usize) {
        for frame in pfn as usize..pfn as usize + count {
            self.frames.clear(frame);
        }
    }

    pub fn is_frame_used(&self, pfn: u32) -> bool {
        self.frames.is_set(pfn as usize)
    }

    pub fn free_bytes(&self) -> u64 {
        self.frames.free() as u64 * FRAME_SIZE as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.frames.total() as u64 * FRAME_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_frame_request_lands_aligned_at_zero() {
        // 16 frames of empty memory
        let mut alloc = FrameAllocator::new(16 * PAGE_SIZE);
        let chunks = alloc.find_frames(16384).unwrap();
        assert_eq!(chunks, vec![(0, 16384)]);
        for pfn in 0..4 {
            assert!(alloc.is_frame_used(pfn));
        }
        for pfn in 4..16 {
            assert!(!alloc.is_frame_used(pfn));
        }
    }

    #[test]
    fn unaligned_free_run_is_skipped() {
        let mut alloc = FrameAllocator::new(16 * PAGE_SIZE);
        // occupy frame 0 so the run 1..5 is free but misaligned for 4 frames
        alloc.find_frames(PAGE_SIZE).unwrap();
        let chunks = alloc.find_frames(4 * PAGE_SIZE).unwrap();
        assert_eq!(chunks, vec![(4, 4 * PAGE_SIZE)]);
    }

    #[test]
    fn fragmented_request_splits_into_halves() {
        let mut alloc = FrameAllocator::new(8 * PAGE_SIZE);
        // pin frames 2 and 5: neither aligned 4-frame run survives
        for _ in 0..6 {
            alloc.find_frames(PAGE_SIZE).unwrap();
        }
        alloc.free_range(0, 2);
        alloc.free_range(3, 2);

        let chunks = alloc.find_frames(4 * PAGE_SIZE).unwrap();
        assert_eq!(chunks, vec![(0, 2 * PAGE_SIZE), (6, 2 * PAGE_SIZE)]);
    }

    #[test]
    fn exhaustion_reports_out_of_memory_and_rolls_back() {
        let mut alloc = FrameAllocator::new(4 * PAGE_SIZE);
        alloc.find_frames(2 * PAGE_SIZE).unwrap(); // frames 0-1
        alloc.find_frames(PAGE_SIZE).unwrap(); // frame 2

        // 4 frames can never fit; the split path must not leak frame 3
        assert_eq!(
            alloc.find_frames(4 * PAGE_SIZE).unwrap_err(),
            MemoryError::OutOfMemory
        );
        assert!(!alloc.is_frame_used(3));
        assert_eq!(alloc.free_bytes(), PAGE_SIZE);
    }

    #[test]
    fn freed_frames_are_reused() {
        let mut alloc = FrameAllocator::new(4 * PAGE_SIZE);
        let chunks = alloc.find_frames(4 * PAGE_SIZE).unwrap();
        alloc.free_range(chunks[0].0, 4);
        assert_eq!(alloc.free_bytes(), 4 * PAGE_SIZE);
        assert_eq!(alloc.find_frames(4 * PAGE_SIZE).unwrap(), chunks);
    }

    #[test]
    fn live_allocations_never_overlap() {
        let mut alloc = FrameAllocator::new(64 * PAGE_SIZE);
        let mut owned = vec![];
        for size in [4, 1, 8, 2, 1] {
            owned.extend(alloc.find_frames(size * PAGE_SIZE).unwrap());
        }

        let mut claimed = std::collections::BTreeSet::new();
        for (pfn, size) in &owned {
            for frame in *pfn..*pfn + (size / PAGE_SIZE) as u32 {
                // each frame belongs to exactly one allocation
                assert!(claimed.insert(frame));
            }
        }
        // the bitmap's set bits are exactly the union of the allocations
        for frame in 0..64 {
            assert_eq!(alloc.is_frame_used(frame), claimed.contains(&frame));
        }
    }

    #[test]
    fn find_free_frame_scans_linearly() {
        let mut alloc = FrameAllocator::new(4 * PAGE_SIZE);
        assert_eq!(alloc.find_free_frame(), Some(0));
        alloc.find_frames(2 * PAGE_SIZE).unwrap();
        assert_eq!(alloc.find_free_frame(), Some(2));
    }
}
