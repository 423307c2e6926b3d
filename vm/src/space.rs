//! Per-process address space state.
//!
//! An [`AddressSpace`] bundles everything the core keeps per process: the
//! supplemental page table, the handle to the process's hardware page
//! directory, and the table of live file mappings. Frame-table entries
//! hold an `Arc` back-link to the owning space so eviction can reach the
//! victim's tables from any thread.
//!
//! Lock order: the frame-table lock is always taken before a space's SPT
//! lock; no method here takes the SPT lock and then enters the frame
//! table.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::addr::{KernelPage, UserPage};
use crate::error::VmResult;
use crate::mmap::MmapTable;
use crate::page::{PageSnapshot, SuppPageTable};
use crate::platform::{MappedFile, PageDirectory};

/// One process's view of virtual memory.
pub struct AddressSpace {
    pagedir: Arc<dyn PageDirectory>,
    pub(crate) pages: Mutex<SuppPageTable>,
    pub(crate) mmaps: Mutex<MmapTable>,
}

impl AddressSpace {
    /// Create an address space over the given hardware page directory.
    pub fn new(pagedir: Arc<dyn PageDirectory>) -> Arc<Self> {
        Arc::new(Self {
            pagedir,
            pages: Mutex::new(SuppPageTable::new()),
            mmaps: Mutex::new(MmapTable::new()),
        })
    }

    /// The hardware page directory backing this space.
    pub fn pagedir(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }

    /// Record a page that is already resident and mapped (initial segment
    /// loading). Fails when the page is already known.
    pub fn install_frame(&self, upage: UserPage, kpage: KernelPage) -> VmResult<()> {
        self.pages.lock().install_frame(upage, kpage)
    }

    /// Record a zero-fill-on-demand page.
    pub fn install_zeropage(&self, upage: UserPage) {
        self.pages.lock().install_zeropage(upage)
    }

    /// Record a file-backed demand page.
    pub fn install_filesys(
        &self,
        upage: UserPage,
        file: Arc<dyn MappedFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        self.pages
            .lock()
            .install_filesys(upage, file, offset, read_bytes, zero_bytes, writable)
    }

    /// OR `dirty` into the page's accumulated dirtiness.
    pub fn set_dirty(&self, upage: UserPage, dirty: bool) {
        self.pages.lock().set_dirty(upage, dirty)
    }

    /// Whether the space knows about `upage`.
    pub fn has_entry(&self, upage: UserPage) -> bool {
        self.pages.lock().has_entry(upage)
    }

    /// Number of known pages.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Number of live file mappings.
    pub fn mapping_count(&self) -> usize {
        self.mmaps.lock().len()
    }

    /// Read-only view of the supplemental page table.
    pub fn page_snapshot(&self) -> Vec<PageSnapshot> {
        self.pages.lock().snapshot()
    }
}
