//! Swap space: page-sized slots on a block device, tracked with a bitmap.

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};
use core::fmt;
use log::{debug, info, trace};
use nephron_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

const BITS: usize = u64::BITS as usize;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    #[cfg(test)]
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn first_sector(self) -> BlockSector {
        self.0 * SECTORS_PER_PAGE
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

struct SwapInner {
    block: Block,
    /// Bit set means the slot holds live data.
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SwapInner {
    fn is_used(&self, slot: SwapSlot) -> bool {
        let index = slot.index();
        assert!(index < self.slots, "{slot} is past the end of swap");
        self.bitmap[index / BITS] & (1 << (index % BITS)) != 0
    }

    fn set_used(&mut self, slot: SwapSlot, used: bool) {
        let index = slot.index();
        let bit = 1 << (index % BITS);
        if used {
            self.bitmap[index / BITS] |= bit;
            self.used += 1;
        } else {
            self.bitmap[index / BITS] &= !bit;
            self.used -= 1;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn first_free(&self) -> Option<SwapSlot> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * BITS + word.trailing_ones() as usize)
            .filter(|&index| index < self.slots)
            .map(|index| SwapSlot(index as u32))
    }
}

/// The swap device and its slot table, behind one lock.
pub struct SwapSpace {
    inner: Mutex<SwapInner>,
}

impl SwapSpace {
    pub fn new(block: Block) -> Self {
        let slots = (block.get_size() / SECTORS_PER_PAGE) as usize;
        info!("swap: {} with {} page slots", block, slots);

        Self {
            inner: Mutex::new(SwapInner {
                block,
                bitmap: vec![0; slots.div_ceil(BITS)],
                slots,
                used: 0,
            }),
        }
    }

    /// Claim the first free slot.
    ///
    /// # Panics
    ///
    /// Panics if every slot is in use.
    pub fn allocate_slot(&self) -> SwapSlot {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.first_free() else {
            panic!("swap is full ({} slots)", inner.slots);
        };
        inner.set_used(slot, true);
        trace!("swap: allocated {}", slot);
        slot
    }

    /// Write one page to `slot`, which must be allocated.
    pub fn write(&self, slot: SwapSlot, page: &[u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let mut inner = self.inner.lock();
        assert!(inner.is_used(slot), "writing unallocated swap {slot}");

        for (sector, chunk) in (slot.first_sector()..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            inner.block.write(sector, chunk)?;
        }
        Ok(())
    }

    /// Read one page from `slot`, which must be allocated.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let mut inner = self.inner.lock();
        assert!(inner.is_used(slot), "reading free swap {slot}");

        for (sector, chunk) in (slot.first_sector()..).zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE))
        {
            inner.block.read(sector, chunk)?;
        }
        Ok(())
    }

    /// Release `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already free.
    pub fn free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        assert!(inner.is_used(slot), "freeing free swap {slot}");
        inner.set_used(slot, false);
        trace!("swap: freed {}", slot);
    }

    /// Copy `page` out to a newly allocated slot.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, BlockError> {
        let slot = self.allocate_slot();
        if let Err(err) = self.write(slot, page) {
            self.free(slot);
            return Err(err);
        }
        debug!("swap: page out to {}", slot);
        Ok(slot)
    }

    /// Copy `slot` into `page` and release the slot. On error the slot is kept.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        self.read(slot, page)?;
        self.free(slot);
        debug!("swap: page in from {}", slot);
        Ok(())
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots
    }
}

impl fmt::Display for SwapSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        write!(f, "swap: {}/{} slots in use", inner.used, inner.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use alloc::collections::BTreeSet;
    use proptest::prelude::*;

    fn swap_with_slots(slots: u32) -> SwapSpace {
        let disk = RamDisk::new(slots * SECTORS_PER_PAGE);
        SwapSpace::new(Block::new(
            "swap",
            BlockType::Swap,
            BlockDriver::RamDisk(disk),
        ))
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..PAGE_FRAME_SIZE)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn round_trip_frees_slot() {
        let swap = swap_with_slots(4);
        let page = pattern(7);
        let slot = swap.swap_out(&page).expect("swap out");
        assert_eq!(swap.used_slots(), 1);

        let mut back = vec![0; PAGE_FRAME_SIZE];
        swap.swap_in(slot, &mut back).expect("swap in");
        assert_eq!(back, page);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn slots_do_not_overlap() {
        let swap = swap_with_slots(3);
        let slots: Vec<_> = (0..3u8)
            .map(|seed| swap.swap_out(&pattern(seed)).expect("swap out"))
            .collect();
        assert_eq!(slots, [SwapSlot(0), SwapSlot(1), SwapSlot(2)]);

        for (seed, slot) in slots.into_iter().enumerate().rev() {
            let mut back = vec![0; PAGE_FRAME_SIZE];
            swap.swap_in(slot, &mut back).expect("swap in");
            assert_eq!(back, pattern(seed as u8));
        }
    }

    #[test]
    fn reuses_lowest_free_slot() {
        let swap = swap_with_slots(3);
        let a = swap.allocate_slot();
        let b = swap.allocate_slot();
        swap.free(a);
        assert_eq!(swap.allocate_slot(), a);
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "swap is full")]
    fn full_swap_panics() {
        let swap = swap_with_slots(2);
        swap.allocate_slot();
        swap.allocate_slot();
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "freeing free swap")]
    fn double_free_panics() {
        let swap = swap_with_slots(2);
        let slot = swap.allocate_slot();
        swap.free(slot);
        swap.free(slot);
    }

    #[test]
    #[should_panic(expected = "reading free swap")]
    fn read_after_swap_in_panics() {
        let swap = swap_with_slots(1);
        let slot = swap.swap_out(&pattern(1)).expect("swap out");
        let mut page = vec![0; PAGE_FRAME_SIZE];
        swap.swap_in(slot, &mut page).expect("swap in");
        let _ = swap.read(slot, &mut page);
    }

    #[test]
    fn slot_count_ignores_partial_pages() {
        let disk = RamDisk::new(SECTORS_PER_PAGE * 2 + 3);
        let swap = SwapSpace::new(Block::new("swap", BlockType::Swap, BlockDriver::RamDisk(disk)));
        assert_eq!(swap.slot_count(), 2);
    }

    proptest! {
        #[test]
        fn bitmap_tracks_a_set(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let swap = swap_with_slots(70);
            let mut live = BTreeSet::new();
            for allocate in ops {
                if allocate && live.len() < 70 {
                    let slot = swap.allocate_slot();
                    prop_assert!(live.insert(slot));
                    // Always the lowest free index.
                    prop_assert!((0..slot.index()).all(|i| live.contains(&SwapSlot(i as u32))));
                } else if let Some(&slot) = live.iter().next_back() {
                    swap.free(slot);
                    live.remove(&slot);
                }
                prop_assert_eq!(swap.used_slots(), live.len());
            }
        }
    }
}
