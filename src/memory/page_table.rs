use crate::constants::memory::{LEVEL_BITS, LEVEL_ENTRIES, LEVEL_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::MemoryError;

/// One page-table slot. A page larger than 4 KiB stores an identical copy of
/// its entry in every 4 KiB slot it covers, so any address inside the page
/// resolves in a single lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    /// Base virtual page number of the page this entry describes.
    pub vpn: u32,
    pub pfn: u32,
    pub page_size: u32,
    /// Clear while the page is swapped out.
    pub present: bool,
}

type LeafTable = [Option<Pte>; LEVEL_ENTRIES];

/// Per-process two-level page table: a fixed 1024-entry directory of lazily
/// allocated 1024-entry leaf tables. An empty slot is a never-mapped page.
pub struct TwoLevelPageTable {
    pid: u32,
    directory: Vec<Option<Box<LeafTable>>>,
}

impl TwoLevelPageTable {
    pub fn new(pid: u32) -> Self {
        let mut directory = Vec::with_capacity(LEVEL_ENTRIES);
        directory.resize_with(LEVEL_ENTRIES, || None);
        TwoLevelPageTable { pid, directory }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Installs a mapping of `page_size` bytes at `vpn`, replicating the
    /// entry into every 4 KiB slot the page occupies. Overwrites whatever
    /// was there before.
    pub fn map(&mut self, page_size: u32, vpn: u32, pfn: u32) {
        let pte = Pte {
            vpn,
            pfn,
            page_size,
            present: true,
        };
        for slot in Self::page_slots(vpn, page_size) {
            *self.slot_mut(slot) = Some(pte);
        }
    }

    /// Walks the table for `vaddr` using the fixed 10/10/12 decomposition.
    pub fn translate(&self, vaddr: u32) -> Result<Pte, MemoryError> {
        let pte = self
            .entry(vaddr >> PAGE_SHIFT)
            .ok_or(MemoryError::InvalidMapping)?;
        if !pte.present {
            return Err(MemoryError::PageFault);
        }
        Ok(pte)
    }

    /// Raw slot read, ignoring the present bit. Used by swap-in and free to
    /// recover the geometry of a non-resident page.
    pub fn entry(&self, vpn: u32) -> Option<Pte> {
        let dir = (vpn >> LEVEL_BITS) as usize;
        let idx = (vpn & LEVEL_MASK) as usize;
        self.directory.get(dir)?.as_ref()?[idx]
    }

    /// Removes the page covering `vpn` from every slot it occupies. No-op
    /// when the slot was never mapped.
    pub fn unmap(&mut self, vpn: u32) {
        let Some(pte) = self.entry(vpn) else {
            return;
        };
        for slot in Self::page_slots(pte.vpn, pte.page_size) {
            *self.slot_mut(slot) = None;
        }
    }

    /// Clears the present bit across the whole page, leaving the mapping
    /// itself in place. Used when the page is swapped out.
    pub fn clear_present(&mut self, vpn: u32) {
        let Some(pte) = self.entry(vpn) else {
            return;
        };
        for slot in Self::page_slots(pte.vpn, pte.page_size) {
            if let Some(entry) = self.slot_mut(slot) {
                entry.present = false;
            }
        }
    }

    fn page_slots(vpn: u32, page_size: u32) -> core::ops::Range<u32> {
        vpn..vpn + (page_size as u64 / PAGE_SIZE) as u32
    }

    fn slot_mut(&mut self, vpn: u32) -> &mut Option<Pte> {
        let dir = (vpn >> LEVEL_BITS) as usize;
        let idx = (vpn & LEVEL_MASK) as usize;
        let table = self.directory[dir].get_or_insert_with(|| Box::new([None; LEVEL_ENTRIES]));
        &mut table[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB4: u32 = PAGE_SIZE as u32;

    #[test]
    fn map_then_translate_round_trips() {
        let mut table = TwoLevelPageTable::new(1);
        table.map(KB4, 100, 5);

        let pte = table.translate(100 * KB4).unwrap();
        assert_eq!(pte.pfn, 5);
        assert_eq!(pte.page_size, KB4);
    }

    #[test]
    fn every_subpage_of_a_larger_page_resolves() {
        let mut table = TwoLevelPageTable::new(1);
        table.map(4 * KB4, 8, 40);

        for vpn in 8..12 {
            let pte = table.translate(vpn * KB4).unwrap();
            assert_eq!((pte.pfn, pte.page_size, pte.vpn), (40, 4 * KB4, 8));
        }
        assert_eq!(
            table.translate(12 * KB4).unwrap_err(),
            MemoryError::InvalidMapping
        );
    }

    #[test]
    fn huge_page_spans_directory_entries() {
        let mut table = TwoLevelPageTable::new(1);
        // 8 MiB page: 2048 slots, crossing one directory boundary
        table.map(8 * 1024 * 1024, 0, 0);

        assert_eq!(table.translate(0).unwrap().pfn, 0);
        assert_eq!(table.translate(1023 * KB4).unwrap().vpn, 0);
        assert_eq!(table.translate(2047 * KB4).unwrap().vpn, 0);
        assert_eq!(
            table.translate(2048 * KB4).unwrap_err(),
            MemoryError::InvalidMapping
        );
    }

    #[test]
    fn unmap_clears_every_slot_from_any_interior_vpn() {
        let mut table = TwoLevelPageTable::new(1);
        table.map(4 * KB4, 8, 40);

        table.unmap(10); // interior slot; span recomputed from the entry
        for vpn in 8..12 {
            assert_eq!(
                table.translate(vpn * KB4).unwrap_err(),
                MemoryError::InvalidMapping
            );
        }
    }

    #[test]
    fn unmap_of_unmapped_slot_is_a_no_op() {
        let mut table = TwoLevelPageTable::new(1);
        table.unmap(77);
        assert_eq!(table.entry(77), None);
    }

    #[test]
    fn clear_present_turns_translation_into_page_fault() {
        let mut table = TwoLevelPageTable::new(1);
        table.map(2 * KB4, 16, 60);

        table.clear_present(16);
        for vpn in 16..18 {
            assert_eq!(
                table.translate(vpn * KB4).unwrap_err(),
                MemoryError::PageFault
            );
        }
        // the mapping itself survives
        let stale = table.entry(16).unwrap();
        assert_eq!((stale.pfn, stale.page_size), (60, 2 * KB4));
    }

    #[test]
    fn remap_overwrites_prior_entry() {
        let mut table = TwoLevelPageTable::new(1);
        table.map(KB4, 5, 9);
        table.map(KB4, 5, 13);
        assert_eq!(table.translate(5 * KB4).unwrap().pfn, 13);
    }

    #[test]
    fn top_of_address_space_is_mappable() {
        let mut table = TwoLevelPageTable::new(1);
        // last 4 MiB of the 32-bit space, as used by stack regions
        let vpn = 0xFFC00000u32 >> PAGE_SHIFT;
        table.map(4 * 1024 * 1024, vpn, 123);
        assert_eq!(table.translate(0xFFFFF000).unwrap().pfn, 123);
    }
}
