//! The owning container for the process-wide virtual-memory state.
//!
//! One [`Vm`] is constructed at kernel initialisation and owns the frame
//! table and the swap store; address spaces are created per process and
//! torn down through [`Vm::destroy_space`]. There are no hidden globals --
//! a test constructs a fresh core with two in-memory devices and throws
//! it away afterwards.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use crate::addr::KernelPage;
use crate::frame::{FrameSnapshot, FrameTable};
use crate::page::PageStatus;
use crate::platform::{BlockDevice, FrameSource};
use crate::space::AddressSpace;
use crate::swap::{SwapSlot, SwapStats, SwapStore};

/// The virtual-memory core.
pub struct Vm {
    pub(crate) phys: Arc<dyn FrameSource>,
    pub(crate) swap: Arc<Mutex<SwapStore>>,
    pub(crate) frames: Mutex<FrameTable>,
}

impl Vm {
    /// Bring up the core over a physical allocator and a swap device.
    pub fn new(phys: Arc<dyn FrameSource>, swap_device: Arc<dyn BlockDevice>) -> Self {
        let swap = Arc::new(Mutex::new(SwapStore::new(swap_device)));
        let frames = Mutex::new(FrameTable::new(Arc::clone(&phys), Arc::clone(&swap)));
        debug!("[VM] core initialised");
        Self { phys, swap, frames }
    }

    /// Pin the resident frame at `kpage` (ineligible for eviction).
    pub fn pin_frame(&self, kpage: KernelPage) {
        self.frames.lock().pin(kpage);
    }

    /// Unpin the resident frame at `kpage`.
    pub fn unpin_frame(&self, kpage: KernelPage) {
        self.frames.lock().unpin(kpage);
    }

    /// Number of resident user frames.
    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Read-only view of the frame table, in clock order.
    pub fn frame_snapshot(&self) -> Vec<FrameSnapshot> {
        self.frames.lock().snapshot()
    }

    /// Swap occupancy counters.
    pub fn swap_stats(&self) -> SwapStats {
        self.swap.lock().stats()
    }

    /// Whether the given swap slot currently holds a page.
    pub fn swap_is_occupied(&self, slot: SwapSlot) -> bool {
        self.swap.lock().is_occupied(slot)
    }

    /// Tear down an address space.
    ///
    /// Live file mappings are unmapped first (with their write-back
    /// semantics), then every remaining page entry is released: resident
    /// frames leave the frame table without reclaiming the physical frame
    /// (the surrounding kernel frees those together with the page
    /// directory), swapped pages give their slot back, and zero/file pages
    /// need no work.
    pub fn destroy_space(&self, space: &Arc<AddressSpace>) {
        let ids = space.mmaps.lock().ids();
        for id in ids {
            if let Err(err) = self.munmap(space, id) {
                warn!("[VM] teardown unmap of {:?} failed: {}", id, err);
            }
        }

        let mut slots = Vec::new();
        {
            let mut frames = self.frames.lock();
            let mut pages = space.pages.lock();
            for (upage, entry) in pages.drain() {
                match entry.status {
                    PageStatus::OnFrame { kpage, .. } => {
                        frames.remove_entry(kpage);
                        debug!(
                            "[VM] teardown released frame {:#x} for {:#x}",
                            kpage.addr(),
                            upage.addr()
                        );
                    }
                    PageStatus::OnSwap { slot } => slots.push(slot),
                    PageStatus::AllZeros | PageStatus::FromFile { .. } => {}
                }
            }
        }

        let mut swap = self.swap.lock();
        for slot in slots {
            swap.free_slot(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::UserPage;
    use crate::sim::{SimDisk, SimFrames, SimPageDir};
    use crate::swap::SECTORS_PER_PAGE;

    fn core(frames: usize, slots: usize) -> (Vm, Arc<SimPageDir>, Arc<AddressSpace>) {
        let phys = Arc::new(SimFrames::new(frames));
        let disk = Arc::new(SimDisk::new((slots * SECTORS_PER_PAGE) as u64));
        let vm = Vm::new(phys, disk);
        let pd = Arc::new(SimPageDir::new());
        let space = AddressSpace::new(pd.clone());
        (vm, pd, space)
    }

    fn upage(addr: usize) -> UserPage {
        UserPage::new(addr).unwrap()
    }

    #[test]
    fn test_destroy_space_releases_everything() {
        let (vm, _pd, space) = core(2, 8);

        // One resident page, one swapped page.
        space.install_zeropage(upage(0x1000));
        space.install_zeropage(upage(0x2000));
        space.install_zeropage(upage(0x3000));
        vm.load_page(&space, upage(0x1000)).unwrap();
        vm.load_page(&space, upage(0x2000)).unwrap();
        vm.load_page(&space, upage(0x3000)).unwrap(); // evicts one

        assert_eq!(vm.frame_count(), 2);
        assert_eq!(vm.swap_stats().used, 1);

        vm.destroy_space(&space);

        assert_eq!(vm.frame_count(), 0);
        assert_eq!(vm.swap_stats().used, 0);
        assert_eq!(space.page_count(), 0);
    }
}
