//! Supplemental page table: per-address-space page metadata.
//!
//! For every user page an address space knows about, one [`PageEntry`]
//! records how the page is backed right now and whether it has ever been
//! dirtied. The hardware page directory only knows about resident pages;
//! this table is what lets the fault resolver materialise the rest on
//! demand.
//!
//! Status transitions are deliberately narrow:
//!
//! - `AllZeros` / `FromFile` → `OnFrame` (first fault),
//! - `OnFrame` → `OnSwap` (eviction),
//! - `OnSwap` → `OnFrame` (fault brings it back).
//!
//! The `dirty` flag only accumulates; once a page has been observed dirty
//! it stays dirty until the entry dies, so write-back decisions never lose
//! a write that happened before an eviction cycle.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::addr::{KernelPage, UserPage, PAGE_SIZE};
use crate::error::{VmError, VmResult};
use crate::platform::MappedFile;
use crate::swap::SwapSlot;

/// How a known user page is backed.
#[derive(Clone)]
pub enum PageStatus {
    /// Never touched; the first fault fills the page with zeros.
    AllZeros,
    /// Resident in the frame whose kernel alias is `kpage`. `writable`
    /// records the permission installed in the hardware mapping.
    OnFrame { kpage: KernelPage, writable: bool },
    /// Evicted; the page's bytes live in the given swap slot.
    OnSwap { slot: SwapSlot },
    /// Not yet materialised; the first fault reads `read_bytes` from
    /// `file` at `offset` and zeros the remaining `zero_bytes`.
    FromFile {
        file: Arc<dyn MappedFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
}

impl fmt::Debug for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllZeros => write!(f, "AllZeros"),
            Self::OnFrame { kpage, writable } => {
                write!(f, "OnFrame({:?}, writable={})", kpage, writable)
            }
            Self::OnSwap { slot } => write!(f, "OnSwap({:?})", slot),
            Self::FromFile {
                offset,
                read_bytes,
                zero_bytes,
                writable,
                ..
            } => write!(
                f,
                "FromFile(offset={}, read={}, zero={}, writable={})",
                offset, read_bytes, zero_bytes, writable
            ),
        }
    }
}

/// One supplemental page table entry.
#[derive(Debug, Clone)]
pub struct PageEntry {
    pub(crate) status: PageStatus,
    /// Accumulated dirtiness over the entry's whole life.
    pub(crate) dirty: bool,
}

impl PageEntry {
    /// Whether a write to this page would be legal, given its current or
    /// eventual hardware permission.
    pub(crate) fn can_write(&self) -> bool {
        match &self.status {
            PageStatus::OnFrame { writable, .. } => *writable,
            PageStatus::FromFile { writable, .. } => *writable,
            // Zero and swapped pages always come back writable.
            PageStatus::AllZeros | PageStatus::OnSwap { .. } => true,
        }
    }

    pub(crate) fn is_resident(&self) -> bool {
        matches!(self.status, PageStatus::OnFrame { .. })
    }
}

/// Coarse page state, for snapshots and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    AllZeros,
    OnFrame,
    OnSwap,
    FromFile,
}

/// A read-only view of one entry, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub upage: UserPage,
    pub kind: PageKind,
    pub kpage: Option<KernelPage>,
    pub slot: Option<SwapSlot>,
    pub dirty: bool,
}

/// The supplemental page table of one address space.
///
/// The table itself is not synchronised;
/// [`AddressSpace`](crate::space::AddressSpace) wraps it in the space's
/// SPT lock.
#[derive(Default)]
pub struct SuppPageTable {
    entries: BTreeMap<UserPage, PageEntry>,
}

impl SuppPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page that is already resident in `kpage` (initial segment
    /// loading, or the tail of a fault). Fails when the page is already
    /// known.
    pub fn install_frame(&mut self, upage: UserPage, kpage: KernelPage) -> VmResult<()> {
        if self.entries.contains_key(&upage) {
            return Err(VmError::DuplicatePage {
                addr: upage.addr(),
            });
        }
        self.entries.insert(
            upage,
            PageEntry {
                status: PageStatus::OnFrame {
                    kpage,
                    writable: true,
                },
                dirty: false,
            },
        );
        Ok(())
    }

    /// Record a zero-fill-on-demand page (BSS, stack growth). A duplicate
    /// install is a kernel bug.
    pub fn install_zeropage(&mut self, upage: UserPage) {
        let prior = self.entries.insert(
            upage,
            PageEntry {
                status: PageStatus::AllZeros,
                dirty: false,
            },
        );
        assert!(
            prior.is_none(),
            "[PAGE] duplicate zero-page install at {:#x}",
            upage.addr()
        );
    }

    /// Record a file-backed page (code segment, mmap). A duplicate install
    /// is a kernel bug, as is a read/zero split that does not cover exactly
    /// one page.
    pub fn install_filesys(
        &mut self,
        upage: UserPage,
        file: Arc<dyn MappedFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        assert!(
            read_bytes + zero_bytes == PAGE_SIZE,
            "[PAGE] file page split {}+{} does not cover a page",
            read_bytes,
            zero_bytes
        );
        let prior = self.entries.insert(
            upage,
            PageEntry {
                status: PageStatus::FromFile {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                    writable,
                },
                dirty: false,
            },
        );
        assert!(
            prior.is_none(),
            "[PAGE] duplicate file-page install at {:#x}",
            upage.addr()
        );
    }

    /// Transition an existing entry to `OnSwap`, dropping any frame link.
    /// Returns `false` when the page is unknown.
    pub fn set_swap(&mut self, upage: UserPage, slot: SwapSlot) -> bool {
        match self.entries.get_mut(&upage) {
            Some(entry) => {
                entry.status = PageStatus::OnSwap { slot };
                true
            }
            None => false,
        }
    }

    /// OR `dirty` into the entry's accumulated dirtiness. An unknown page
    /// is a kernel bug.
    pub fn set_dirty(&mut self, upage: UserPage, dirty: bool) {
        match self.entries.get_mut(&upage) {
            Some(entry) => entry.dirty |= dirty,
            None => panic!(
                "[PAGE] set_dirty on unknown page {:#x}",
                upage.addr()
            ),
        }
    }

    pub fn find(&self, upage: UserPage) -> Option<&PageEntry> {
        self.entries.get(&upage)
    }

    pub(crate) fn find_mut(&mut self, upage: UserPage) -> Option<&mut PageEntry> {
        self.entries.get_mut(&upage)
    }

    pub fn has_entry(&self, upage: UserPage) -> bool {
        self.entries.contains_key(&upage)
    }

    pub(crate) fn remove(&mut self, upage: UserPage) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    pub(crate) fn drain(&mut self) -> BTreeMap<UserPage, PageEntry> {
        core::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only view of every entry.
    pub fn snapshot(&self) -> Vec<PageSnapshot> {
        self.entries
            .iter()
            .map(|(&upage, entry)| {
                let (kind, kpage, slot) = match &entry.status {
                    PageStatus::AllZeros => (PageKind::AllZeros, None, None),
                    PageStatus::OnFrame { kpage, .. } => {
                        (PageKind::OnFrame, Some(*kpage), None)
                    }
                    PageStatus::OnSwap { slot } => (PageKind::OnSwap, None, Some(*slot)),
                    PageStatus::FromFile { .. } => (PageKind::FromFile, None, None),
                };
                PageSnapshot {
                    upage,
                    kind,
                    kpage,
                    slot,
                    dirty: entry.dirty,
                }
            })
            .collect()
    }
}
