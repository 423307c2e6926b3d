//! Memory-mapped files: map/unmap and dirty write-back.
//!
//! A mapping installs one file-backed page entry per page of the file;
//! nothing is read until the process faults on the region. Unmapping
//! walks the pages and writes every dirty one back to the file -- straight
//! from the resident frame when the page is in memory, via a scratch
//! frame when it was evicted to swap -- then drops the private file handle.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::fmt;

use alloc::collections::BTreeMap;
use log::debug;

use crate::addr::{KernelPage, UserPage, PAGE_SIZE, USER_VIRTUAL_TOP};
use crate::error::{VmError, VmResult};
use crate::page::PageStatus;
use crate::platform::{AllocFlags, MappedFile};
use crate::space::AddressSpace;
use crate::swap::SwapSlot;
use crate::vm::Vm;

/// Identifier of one live mapping within its address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MapId({})", self.0)
    }
}

/// One live file mapping.
pub(crate) struct MmapRegion {
    /// Private reopen of the user's file; closing the user's descriptor
    /// does not invalidate the mapping.
    file: Arc<dyn MappedFile>,
    base: UserPage,
    len: u64,
}

impl MmapRegion {
    fn page_count(&self) -> usize {
        (self.len as usize).div_ceil(PAGE_SIZE)
    }

    fn page(&self, index: usize) -> UserPage {
        self.base.add_pages(index)
    }

    /// File offset and valid byte count of page `index`.
    fn chunk(&self, index: usize) -> (u64, usize) {
        let offset = (index * PAGE_SIZE) as u64;
        let bytes = min(PAGE_SIZE as u64, self.len - offset) as usize;
        (offset, bytes)
    }
}

/// The mappings of one address space.
#[derive(Default)]
pub(crate) struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
}

impl MmapTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ids are strictly increasing: one past the largest live id, starting
    /// at 1.
    fn next_id(&self) -> MapId {
        match self.regions.keys().next_back() {
            Some(id) => MapId(id.0 + 1),
            None => MapId(1),
        }
    }

    fn insert(&mut self, id: MapId, region: MmapRegion) {
        self.regions.insert(id, region);
    }

    fn remove(&mut self, id: MapId) -> Option<MmapRegion> {
        self.regions.remove(&id)
    }

    pub(crate) fn ids(&self) -> Vec<MapId> {
        self.regions.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.regions.len()
    }
}

/// What an unmapped page needs before its entry dies.
enum Teardown {
    /// Resident: pinned, possibly written back from the frame.
    WriteFrame { kpage: KernelPage, dirty: bool },
    /// Evicted: slot read into a scratch frame if dirty, else just freed.
    FromSwap { slot: SwapSlot, dirty: bool },
    /// Never faulted in: nothing to do.
    Untouched,
}

impl Vm {
    /// Map `file` at `addr`.
    ///
    /// The address must be non-null and page-aligned, the file non-empty,
    /// and no page of the target range already known to the address space.
    /// The whole file is covered; the tail of the last page reads as
    /// zeros. Descriptor-level checks (stdin/stdout, fd validity) belong
    /// to the syscall layer above.
    pub fn mmap(
        &self,
        space: &Arc<AddressSpace>,
        file: &Arc<dyn MappedFile>,
        addr: usize,
    ) -> VmResult<MapId> {
        let base = match UserPage::new(addr) {
            Some(page) if addr != 0 => page,
            _ => return Err(VmError::BadMapAddress { addr }),
        };

        let handle = file.reopen();
        let len = handle.len();
        if len == 0 {
            return Err(VmError::EmptyFile);
        }
        let page_count = (len as usize).div_ceil(PAGE_SIZE);
        if addr + page_count * PAGE_SIZE > USER_VIRTUAL_TOP {
            return Err(VmError::BadMapAddress { addr });
        }

        {
            let mut pages = space.pages.lock();
            for i in 0..page_count {
                let upage = base.add_pages(i);
                if pages.has_entry(upage) {
                    return Err(VmError::MapOverlap {
                        addr: upage.addr(),
                    });
                }
            }
            for i in 0..page_count {
                let offset = (i * PAGE_SIZE) as u64;
                let read_bytes = min(PAGE_SIZE as u64, len - offset) as usize;
                pages.install_filesys(
                    base.add_pages(i),
                    Arc::clone(&handle),
                    offset,
                    read_bytes,
                    PAGE_SIZE - read_bytes,
                    true,
                );
            }
        }

        let id = {
            let mut maps = space.mmaps.lock();
            let id = maps.next_id();
            maps.insert(
                id,
                MmapRegion {
                    file: handle,
                    base,
                    len,
                },
            );
            id
        };
        debug!(
            "[MMAP] mapped {} bytes at {:#x} as {:?}",
            len,
            addr,
            id
        );
        Ok(id)
    }

    /// Unmap a mapping, writing dirty pages back to the file.
    pub fn munmap(&self, space: &Arc<AddressSpace>, id: MapId) -> VmResult<()> {
        let region = space
            .mmaps
            .lock()
            .remove(id)
            .ok_or(VmError::UnknownMapping { id: id.as_u32() })?;
        debug!(
            "[MMAP] unmapping {:?} at {:#x} ({} pages)",
            id,
            region.base.addr(),
            region.page_count()
        );
        for i in 0..region.page_count() {
            self.unmap_page(space, &region, i)?;
        }
        // Dropping the region closes the private file handle.
        Ok(())
    }

    fn unmap_page(&self, space: &Arc<AddressSpace>, region: &MmapRegion, index: usize) -> VmResult<()> {
        let upage = region.page(index);
        let (offset, bytes_len) = region.chunk(index);

        // Classify under the frame lock so a resident page is pinned in
        // the same step that observes it (eviction cannot slip between).
        let action = {
            let mut frames = self.frames.lock();
            let pages = space.pages.lock();
            let entry = match pages.find(upage) {
                Some(entry) => entry,
                None => panic!(
                    "[MMAP] mapped page {:#x} missing from the page table",
                    upage.addr()
                ),
            };
            match &entry.status {
                PageStatus::OnFrame { kpage, .. } => {
                    frames.pin(*kpage);
                    Teardown::WriteFrame {
                        kpage: *kpage,
                        dirty: entry.dirty,
                    }
                }
                PageStatus::OnSwap { slot } => Teardown::FromSwap {
                    slot: *slot,
                    dirty: entry.dirty,
                },
                PageStatus::FromFile { .. } => Teardown::Untouched,
                PageStatus::AllZeros => panic!(
                    "[MMAP] zero page inside a file mapping at {:#x}",
                    upage.addr()
                ),
            }
        };

        let pd = space.pagedir();
        match action {
            Teardown::WriteFrame { kpage, dirty } => {
                let dirty =
                    dirty || pd.is_dirty(upage.addr()) || pd.is_dirty(kpage.addr());
                if dirty {
                    // Write back while the mapping is still live, from the
                    // frame's kernel alias (the same bytes the user
                    // mapping addresses).
                    // SAFETY: the frame is pinned and only the owner (the
                    // caller) accesses the page during its own munmap.
                    let bytes = unsafe { kpage.bytes() };
                    region.file.write_at(&bytes[..bytes_len], offset);
                }
                pd.clear_page(upage);
                self.frames.lock().free(kpage);
            }
            Teardown::FromSwap { slot, dirty } => {
                let dirty = dirty || pd.is_dirty(upage.addr());
                if dirty {
                    // Like `alloc`, scratch allocation evicts until the
                    // allocator yields a frame.
                    let scratch = loop {
                        if let Some(kpage) = self.phys.get_page(AllocFlags::empty()) {
                            break kpage;
                        }
                        self.frames.lock().evict_one();
                    };
                    self.swap.lock().read_in(slot, scratch);
                    // SAFETY: the scratch frame is freshly allocated and
                    // exclusively ours until freed below.
                    let bytes = unsafe { scratch.bytes() };
                    region.file.write_at(&bytes[..bytes_len], offset);
                    self.phys.free_page(scratch);
                } else {
                    self.swap.lock().free_slot(slot);
                }
            }
            Teardown::Untouched => {}
        }

        space.pages.lock().remove(upage);
        Ok(())
    }
}
