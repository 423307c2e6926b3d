//! Swap store: bitmap-managed page slots over a block device.
//!
//! The swap device is carved into fixed-size slots of
//! [`SECTORS_PER_PAGE`] sectors, one evicted page per slot. A bitmap
//! tracks which slots are occupied; allocation is a first-free scan.
//! Misuse -- reading or freeing an unoccupied slot, indexing past the end --
//! indicates a bookkeeping bug elsewhere in the kernel and panics.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::debug;

use crate::addr::{KernelPage, PAGE_SIZE};
use crate::platform::{BlockDevice, SECTOR_SIZE};

/// Sectors occupied by one page-sized slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Index of one page-sized slot on the swap device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The slot's index within the store.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

/// Occupancy statistics for the swap store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStats {
    pub slot_count: usize,
    pub used: usize,
}

/// The process-wide swap store.
pub struct SwapStore {
    device: Arc<dyn BlockDevice>,
    /// One bit per slot, set = occupied.
    bitmap: Vec<u64>,
    slot_count: usize,
    used: usize,
}

impl SwapStore {
    /// Bind the store to its block device. Every slot starts free.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = (device.sector_count() / SECTORS_PER_PAGE as u64) as usize;
        let words = slot_count.div_ceil(64);
        debug!(
            "[SWAP] store ready: {} slots ({} KiB)",
            slot_count,
            slot_count * PAGE_SIZE / 1024
        );
        Self {
            device,
            bitmap: vec![0u64; words],
            slot_count,
            used: 0,
        }
    }

    /// Write the frame at `kpage` to the first free slot and return it.
    ///
    /// Running out of slots is a fatal resource-exhaustion condition: the
    /// design assumes the swap partition is large enough.
    pub fn write_out(&mut self, kpage: KernelPage) -> SwapSlot {
        let slot = match self.find_free() {
            Some(index) => SwapSlot::new(index as u32),
            None => panic!(
                "[SWAP] out of swap slots ({} in use)",
                self.used
            ),
        };
        self.mark(slot, true);

        // SAFETY: eviction holds the frame-table lock and the victim frame
        // has been unmapped from its owner, so nothing mutates the frame
        // while we copy it out.
        let bytes = unsafe { kpage.bytes() };
        let base = slot.index() as u64 * SECTORS_PER_PAGE as u64;
        for (i, sector) in bytes.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_sector(base + i as u64, sector);
        }
        debug!("[SWAP] wrote {:?} to slot {}", kpage, slot.index());
        slot
    }

    /// Read the slot's page into the frame at `kpage` and release the slot.
    ///
    /// After this returns the slot is free and the caller must not rely on
    /// its former association with the page.
    pub fn read_in(&mut self, slot: SwapSlot, kpage: KernelPage) {
        assert!(
            self.is_occupied(slot),
            "[SWAP] read of unoccupied slot {}",
            slot.index()
        );

        // SAFETY: the caller owns the destination frame exclusively (it is
        // freshly allocated and pinned), so writing its bytes is sound.
        let bytes = unsafe { kpage.bytes_mut() };
        let base = slot.index() as u64 * SECTORS_PER_PAGE as u64;
        for (i, sector) in bytes.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read_sector(base + i as u64, sector);
        }
        self.mark(slot, false);
        debug!("[SWAP] read slot {} into {:?}", slot.index(), kpage);
    }

    /// Release an occupied slot without reading it back.
    pub fn free_slot(&mut self, slot: SwapSlot) {
        assert!(
            self.is_occupied(slot),
            "[SWAP] free of unoccupied slot {}",
            slot.index()
        );
        self.mark(slot, false);
    }

    /// Whether `slot` currently holds a page.
    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        let index = slot.index();
        assert!(
            index < self.slot_count,
            "[SWAP] slot {} out of range ({} slots)",
            index,
            self.slot_count
        );
        self.bitmap[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Total number of slots on the device.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Occupancy counters.
    pub fn stats(&self) -> SwapStats {
        SwapStats {
            slot_count: self.slot_count,
            used: self.used,
        }
    }

    /// First free slot index, if any.
    fn find_free(&self) -> Option<usize> {
        for (word_index, &word) in self.bitmap.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = word_index * 64 + bit;
            if index < self.slot_count {
                return Some(index);
            }
        }
        None
    }

    fn mark(&mut self, slot: SwapSlot, occupied: bool) {
        let index = slot.index();
        let mask = 1u64 << (index % 64);
        if occupied {
            self.bitmap[index / 64] |= mask;
            self.used += 1;
        } else {
            self.bitmap[index / 64] &= !mask;
            self.used -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AllocFlags, FrameSource};
    use crate::sim::{SimDisk, SimFrames};

    fn store_with(slots: usize) -> (SwapStore, Arc<SimFrames>) {
        let disk = Arc::new(SimDisk::new((slots * SECTORS_PER_PAGE) as u64));
        let frames = Arc::new(SimFrames::new(4));
        (SwapStore::new(disk), frames)
    }

    #[test]
    fn test_slot_count_from_device() {
        let (store, _frames) = store_with(16);
        assert_eq!(store.slot_count(), 16);
        assert_eq!(store.stats().used, 0);
    }

    #[test]
    fn test_write_out_read_in_round_trip() {
        let (mut store, frames) = store_with(8);
        let src = frames.get_page(AllocFlags::USER).unwrap();
        let dst = frames.get_page(AllocFlags::ZERO).unwrap();

        // SAFETY: both frames were just allocated and are exclusively ours.
        let src_bytes = unsafe { src.bytes_mut() };
        for (i, b) in src_bytes.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let slot = store.write_out(src);
        assert!(store.is_occupied(slot));
        assert_eq!(store.stats().used, 1);

        store.read_in(slot, dst);
        assert!(!store.is_occupied(slot));
        assert_eq!(store.stats().used, 0);

        // SAFETY: dst is still exclusively ours.
        let dst_bytes = unsafe { dst.bytes() };
        for (i, &b) in dst_bytes.iter().enumerate() {
            assert_eq!(b, (i % 251) as u8);
        }
    }

    #[test]
    fn test_slots_reused_after_free() {
        let (mut store, frames) = store_with(2);
        let page = frames.get_page(AllocFlags::ZERO).unwrap();

        let first = store.write_out(page);
        let second = store.write_out(page);
        assert_ne!(first, second);

        store.free_slot(first);
        let third = store.write_out(page);
        assert_eq!(first, third);
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn test_exhaustion_panics() {
        let (mut store, frames) = store_with(1);
        let page = frames.get_page(AllocFlags::ZERO).unwrap();
        let _ = store.write_out(page);
        let _ = store.write_out(page);
    }

    #[test]
    #[should_panic(expected = "free of unoccupied slot")]
    fn test_double_free_panics() {
        let (mut store, frames) = store_with(2);
        let page = frames.get_page(AllocFlags::ZERO).unwrap();
        let slot = store.write_out(page);
        store.free_slot(slot);
        store.free_slot(slot);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_slot_panics() {
        let (store, _frames) = store_with(2);
        let _ = store.is_occupied(SwapSlot(7));
    }
}
