//! In-memory implementations of the platform interfaces.
//!
//! These stand in for the real machine: a bounded pool of page frames, a
//! page directory that models hardware accessed/dirty bits, a RAM-backed
//! block device, and a file whose reopened handles share one backing
//! buffer. The test suite builds a complete core out of them; they are
//! also handy for exercises that want to watch the eviction machinery
//! without booting anything.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::cmp::min;

use spin::Mutex;

use crate::addr::{page_round_down, KernelPage, UserPage, PAGE_SIZE};
use crate::platform::{AllocFlags, BlockDevice, FrameSource, MappedFile, PageDirectory, SECTOR_SIZE};

// ===========================================================================
// Physical frame pool
// ===========================================================================

/// One page-aligned frame of backing storage.
#[repr(align(4096))]
struct PageCell(UnsafeCell<[u8; PAGE_SIZE]>);

// SAFETY: the cell's bytes are only ever accessed through pointers handed
// out by `SimFrames`, which gives each live frame exactly one owner; the
// pool itself never touches the bytes of an allocated frame.
unsafe impl Sync for PageCell {}

struct FrameState {
    free: Vec<usize>,
    allocated: Vec<bool>,
}

/// A bounded pool of page frames, standing in for the physical allocator.
///
/// The pool's capacity is fixed at construction, which is what makes
/// eviction testable: `SimFrames::new(4)` behaves like a machine with four
/// user frames.
pub struct SimFrames {
    pages: Box<[PageCell]>,
    state: Mutex<FrameState>,
}

impl SimFrames {
    /// A pool of `capacity` zero-initialised frames.
    pub fn new(capacity: usize) -> Self {
        let pages: Box<[PageCell]> = (0..capacity)
            .map(|_| PageCell(UnsafeCell::new([0u8; PAGE_SIZE])))
            .collect();
        // Hand out low indices first.
        let free = (0..capacity).rev().collect();
        Self {
            pages,
            state: Mutex::new(FrameState {
                free,
                allocated: vec![false; capacity],
            }),
        }
    }

    /// Total number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Number of frames currently handed out.
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        state.allocated.iter().filter(|&&a| a).count()
    }

    fn index_of(&self, kpage: KernelPage) -> usize {
        let base = self.pages.as_ptr() as usize;
        let addr = kpage.addr();
        assert!(
            addr >= base && addr < base + self.pages.len() * PAGE_SIZE,
            "[SIM] frame {:#x} does not belong to this pool",
            addr
        );
        (addr - base) / PAGE_SIZE
    }
}

// SAFETY: frames are backed by a boxed slice whose heap buffer never moves,
// each element is 4096-aligned and PAGE_SIZE long, and the free list hands
// every index to at most one owner at a time.
unsafe impl FrameSource for SimFrames {
    fn get_page(&self, flags: AllocFlags) -> Option<KernelPage> {
        let index = {
            let mut state = self.state.lock();
            let index = state.free.pop()?;
            state.allocated[index] = true;
            index
        };
        let kpage = KernelPage::new(self.pages[index].0.get() as usize);
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the frame was just popped off the free list, so we
            // are its only owner.
            unsafe { core::ptr::write_bytes(kpage.as_ptr(), 0, PAGE_SIZE) };
        }
        Some(kpage)
    }

    fn free_page(&self, kpage: KernelPage) {
        let index = self.index_of(kpage);
        let mut state = self.state.lock();
        assert!(
            state.allocated[index],
            "[SIM] double free of frame {:#x}",
            kpage.addr()
        );
        state.allocated[index] = false;
        state.free.push(index);
    }
}

// ===========================================================================
// Page directory
// ===========================================================================

#[derive(Clone, Copy)]
struct SimPte {
    kpage: KernelPage,
    writable: bool,
    present: bool,
    accessed: bool,
    dirty: bool,
}

struct PdState {
    /// Keyed by user page address. Cleared mappings keep their entry (and
    /// their accessed/dirty bits) with `present = false`.
    ptes: BTreeMap<usize, SimPte>,
    /// Dirty bits observed through kernel aliases, keyed by page address.
    alias_dirty: BTreeMap<usize, bool>,
    /// When true, `set_page` refuses new mappings.
    fail_installs: bool,
}

/// A software model of one process's hardware page directory.
///
/// Beyond the [`PageDirectory`] trait it offers
/// [`user_read`](Self::user_read) and [`user_write`](Self::user_write),
/// which behave like the MMU: they follow the installed translation,
/// refuse writes through read-only mappings, and set the accessed/dirty
/// bits as a real access would.
#[derive(Default)]
pub struct SimPageDir {
    state: Mutex<PdState>,
}

impl Default for PdState {
    fn default() -> Self {
        Self {
            ptes: BTreeMap::new(),
            alias_dirty: BTreeMap::new(),
            fail_installs: false,
        }
    }
}

impl SimPageDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `set_page` calls fail (to exercise install-failure
    /// paths).
    pub fn set_install_failure(&self, fail: bool) {
        self.state.lock().fail_installs = fail;
    }

    /// The frame and write permission `addr` currently translates to.
    pub fn translate(&self, addr: usize) -> Option<(KernelPage, bool)> {
        let state = self.state.lock();
        let pte = state.ptes.get(&page_round_down(addr))?;
        if !pte.present {
            return None;
        }
        Some((pte.kpage, pte.writable))
    }

    /// Read through the live translations into `buf`, setting accessed
    /// bits on the way. Returns `false` if any touched page is unmapped.
    pub fn user_read(&self, addr: usize, buf: &mut [u8]) -> bool {
        self.user_access(addr, buf.len(), false, |kpage, offset, chunk_len, chunk_start| {
            // SAFETY: the mapping is present, so the frame is live; the
            // owner discipline of the pool makes the bytes readable.
            let bytes = unsafe { kpage.bytes() };
            buf[chunk_start..chunk_start + chunk_len]
                .copy_from_slice(&bytes[offset..offset + chunk_len]);
        })
    }

    /// Write `bytes` through the live translations, like a user store:
    /// fails on unmapped or read-only pages, sets accessed and dirty bits.
    pub fn user_write(&self, addr: usize, bytes: &[u8]) -> bool {
        self.user_access(addr, bytes.len(), true, |kpage, offset, chunk_len, chunk_start| {
            // SAFETY: the mapping is present and writable; the frame is
            // live and the simulated MMU is the only concurrent accessor.
            let frame = unsafe { kpage.bytes_mut() };
            frame[offset..offset + chunk_len]
                .copy_from_slice(&bytes[chunk_start..chunk_start + chunk_len]);
        })
    }

    /// Walk the pages covering `[addr, addr + len)`, apply `copy` per
    /// page, and maintain the hardware bits.
    fn user_access(
        &self,
        addr: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(KernelPage, usize, usize, usize),
    ) -> bool {
        let mut state = self.state.lock();
        let mut done = 0usize;
        while done < len {
            let cur = addr + done;
            let upage = page_round_down(cur);
            let pte = match state.ptes.get_mut(&upage) {
                Some(pte) if pte.present => pte,
                _ => return false,
            };
            if write && !pte.writable {
                return false;
            }
            pte.accessed = true;
            if write {
                pte.dirty = true;
            }
            let offset = cur - upage;
            let chunk_len = min(PAGE_SIZE - offset, len - done);
            copy(pte.kpage, offset, chunk_len, done);
            done += chunk_len;
        }
        true
    }
}

impl PageDirectory for SimPageDir {
    fn set_page(&self, upage: UserPage, kpage: KernelPage, writable: bool) -> bool {
        let mut state = self.state.lock();
        if state.fail_installs {
            return false;
        }
        state.ptes.insert(
            upage.addr(),
            SimPte {
                kpage,
                writable,
                present: true,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn clear_page(&self, upage: UserPage) {
        let mut state = self.state.lock();
        if let Some(pte) = state.ptes.get_mut(&upage.addr()) {
            // The translation dies but the recorded bits stay readable.
            pte.present = false;
        }
    }

    fn is_accessed(&self, upage: UserPage) -> bool {
        let state = self.state.lock();
        state
            .ptes
            .get(&upage.addr())
            .map(|pte| pte.accessed)
            .unwrap_or(false)
    }

    fn set_accessed(&self, upage: UserPage, accessed: bool) {
        let mut state = self.state.lock();
        if let Some(pte) = state.ptes.get_mut(&upage.addr()) {
            pte.accessed = accessed;
        }
    }

    fn is_dirty(&self, addr: usize) -> bool {
        let page = page_round_down(addr);
        let state = self.state.lock();
        if let Some(pte) = state.ptes.get(&page) {
            return pte.dirty;
        }
        state.alias_dirty.get(&page).copied().unwrap_or(false)
    }

    fn set_dirty(&self, addr: usize, dirty: bool) {
        let page = page_round_down(addr);
        let mut state = self.state.lock();
        if let Some(pte) = state.ptes.get_mut(&page) {
            pte.dirty = dirty;
            return;
        }
        state.alias_dirty.insert(page, dirty);
    }
}

// ===========================================================================
// Block device
// ===========================================================================

/// A RAM-backed block device.
pub struct SimDisk {
    sectors: u64,
    data: Mutex<Vec<u8>>,
}

impl SimDisk {
    /// A zero-filled device of `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for SimDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "[SIM] sector buffer size");
        assert!(sector < self.sectors, "[SIM] sector {} out of range", sector);
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "[SIM] sector buffer size");
        assert!(sector < self.sectors, "[SIM] sector {} out of range", sector);
        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

// ===========================================================================
// Files
// ===========================================================================

/// A file whose reopened handles all share one backing buffer, the way
/// independent handles to an inode do.
pub struct SimFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SimFile {
    pub fn new(contents: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(contents)),
        }
    }

    /// Snapshot of the file's bytes, for assertions.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl MappedFile for SimFile {
    fn reopen(&self) -> Arc<dyn MappedFile> {
        Arc::new(SimFile {
            data: Arc::clone(&self.data),
        })
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        // No file growth; the write is clipped to the current length.
        let n = min(buf.len(), data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }
}
