//! Frame table: the registry of every resident user frame.
//!
//! The table is keyed by the frame's kernel alias and doubles as a ring in
//! insertion order; the ring is the domain of the second-chance clock
//! hand. When the physical allocator runs dry, the clock walks the ring,
//! skipping pinned frames and giving recently-accessed frames one
//! reprieve, and evicts the first frame that has neither.
//!
//! Every victim is written to swap, file-backed pages included; restoring
//! clean file pages straight from their file is a possible refinement the
//! current policy deliberately avoids.
//!
//! All mutation happens under the single frame-table lock owned by
//! [`Vm`](crate::vm::Vm). Eviction additionally takes the victim owner's
//! SPT lock and the swap lock, in that order.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;
use spin::Mutex;

use crate::addr::{KernelPage, UserPage};
use crate::platform::{AllocFlags, FrameSource};
use crate::space::AddressSpace;
use crate::swap::SwapStore;

/// One resident user frame.
pub(crate) struct FrameEntry {
    upage: UserPage,
    owner: Arc<AddressSpace>,
    pinned: bool,
}

/// A read-only view of one frame-table entry, for diagnostics and tests.
#[derive(Clone)]
pub struct FrameSnapshot {
    pub kpage: KernelPage,
    pub upage: UserPage,
    pub owner: Arc<AddressSpace>,
    pub pinned: bool,
}

/// The process-wide frame table.
pub struct FrameTable {
    phys: Arc<dyn FrameSource>,
    swap: Arc<Mutex<SwapStore>>,
    entries: BTreeMap<KernelPage, FrameEntry>,
    /// Insertion-ordered ring of frame keys; the clock hand walks this.
    ring: VecDeque<KernelPage>,
    /// Index of the last entry the clock inspected.
    hand: usize,
}

impl FrameTable {
    pub(crate) fn new(phys: Arc<dyn FrameSource>, swap: Arc<Mutex<SwapStore>>) -> Self {
        Self {
            phys,
            swap,
            entries: BTreeMap::new(),
            ring: VecDeque::new(),
            hand: 0,
        }
    }

    /// Obtain a fresh user frame for `upage`, evicting if the allocator is
    /// exhausted. The new entry is born pinned; the caller unpins once the
    /// page is fully installed.
    pub(crate) fn alloc(
        &mut self,
        flags: AllocFlags,
        upage: UserPage,
        owner: &Arc<AddressSpace>,
    ) -> KernelPage {
        let kpage = loop {
            if let Some(kpage) = self.phys.get_page(flags) {
                break kpage;
            }
            self.evict_one();
        };

        let prior = self.entries.insert(
            kpage,
            FrameEntry {
                upage,
                owner: Arc::clone(owner),
                pinned: true,
            },
        );
        assert!(
            prior.is_none(),
            "[FRAME] allocator returned live frame {:#x}",
            kpage.addr()
        );
        self.ring.push_back(kpage);
        kpage
    }

    /// Remove the entry for `kpage` and return the frame to the allocator.
    pub(crate) fn free(&mut self, kpage: KernelPage) {
        self.detach(kpage);
        self.phys.free_page(kpage);
    }

    /// Remove the entry for `kpage` without reclaiming the physical frame
    /// (the caller has already relinquished it, e.g. to the page-directory
    /// teardown).
    pub(crate) fn remove_entry(&mut self, kpage: KernelPage) {
        self.detach(kpage);
    }

    /// Mark the frame ineligible for eviction.
    pub(crate) fn pin(&mut self, kpage: KernelPage) {
        self.entry_mut(kpage).pinned = true;
    }

    /// Make the frame eligible for eviction again.
    pub(crate) fn unpin(&mut self, kpage: KernelPage) {
        self.entry_mut(kpage).pinned = false;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Read-only view of every entry, in clock (insertion) order.
    pub(crate) fn snapshot(&self) -> Vec<FrameSnapshot> {
        self.ring
            .iter()
            .map(|&kpage| {
                let entry = self.entry(kpage);
                FrameSnapshot {
                    kpage,
                    upage: entry.upage,
                    owner: Arc::clone(&entry.owner),
                    pinned: entry.pinned,
                }
            })
            .collect()
    }

    /// Evict one frame: select a victim with the clock, unmap it, write it
    /// to swap, retag the owner's page entry, and return the physical
    /// frame to the allocator. Also used to make room for short-lived
    /// scratch frames during write-back.
    pub(crate) fn evict_one(&mut self) {
        let kpage = self.pick_victim();
        let entry = self.detach(kpage);

        let pd = entry.owner.pagedir();
        // Unmap first so the owner faults instead of racing the copy-out.
        pd.clear_page(entry.upage);
        // The kernel may have written through the alias; check both views.
        let dirty = pd.is_dirty(entry.upage.addr()) || pd.is_dirty(kpage.addr());

        let slot = self.swap.lock().write_out(kpage);

        {
            let mut pages = entry.owner.pages.lock();
            let known = pages.set_swap(entry.upage, slot);
            assert!(
                known,
                "[FRAME] victim {:#x} missing from owner's page table",
                entry.upage.addr()
            );
            pages.set_dirty(entry.upage, dirty);
        }

        self.phys.free_page(kpage);
        debug!(
            "[FRAME] evicted {:#x} (upage {:#x}, dirty={}) to slot {}",
            kpage.addr(),
            entry.upage.addr(),
            dirty,
            slot.index()
        );
    }

    /// Second-chance victim selection.
    ///
    /// Advances the hand one step at a time, skipping pinned frames and
    /// clearing (then forgiving) the accessed bit. A full scan of `2 * N`
    /// steps without a victim means every frame is pinned or the system is
    /// thrashing beyond help; that is a fatal out-of-memory condition.
    fn pick_victim(&mut self) -> KernelPage {
        let n = self.ring.len();
        assert!(n > 0, "[FRAME] nothing to evict: frame table is empty");

        let mut inspected = 0usize;
        loop {
            inspected += 1;
            assert!(
                inspected <= 2 * n,
                "[FRAME] clock scanned {} frames without finding a victim",
                2 * n
            );

            self.hand = (self.hand + 1) % n;
            let kpage = self.ring[self.hand];
            let entry = self.entry(kpage);
            if entry.pinned {
                continue;
            }

            let pd = entry.owner.pagedir();
            if pd.is_accessed(entry.upage) {
                // Second chance: forgive one access per sweep.
                pd.set_accessed(entry.upage, false);
                continue;
            }

            return kpage;
        }
    }

    /// Remove `kpage` from the map and the ring, stepping the hand off the
    /// removed position.
    fn detach(&mut self, kpage: KernelPage) -> FrameEntry {
        let entry = match self.entries.remove(&kpage) {
            Some(entry) => entry,
            None => panic!(
                "[FRAME] operation on unknown frame {:#x}",
                kpage.addr()
            ),
        };
        let pos = self
            .ring
            .iter()
            .position(|&k| k == kpage)
            .expect("frame table ring tracks every entry");
        let _ = self.ring.remove(pos);
        if pos < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.ring.len() {
            self.hand = 0;
        }
        entry
    }

    fn entry(&self, kpage: KernelPage) -> &FrameEntry {
        match self.entries.get(&kpage) {
            Some(entry) => entry,
            None => panic!(
                "[FRAME] operation on unknown frame {:#x}",
                kpage.addr()
            ),
        }
    }

    fn entry_mut(&mut self, kpage: KernelPage) -> &mut FrameEntry {
        match self.entries.get_mut(&kpage) {
            Some(entry) => entry,
            None => panic!(
                "[FRAME] operation on unknown frame {:#x}",
                kpage.addr()
            ),
        }
    }
}
