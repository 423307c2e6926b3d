//! Page-fault resolution and pinning for kernel I/O.
//!
//! [`Vm::load_page`] is the single protocol that materialises a user page
//! on demand, whatever its backing: zero-fill, swap slot, or file. The
//! frame comes out of the frame table born pinned, so a concurrent fault
//! cannot evict it while it is being filled; the pin is released once the
//! hardware mapping is installed.
//!
//! [`Vm::handle_fault`] sits one layer above: it classifies a raw fault
//! (kernel address, protection violation, stack growth, plain demand
//! page) before delegating to the resolver. The syscall layer turns any
//! error into process termination.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::addr::{
    is_user_vaddr, page_round_down, KernelPage, UserPage, PAGE_SIZE, USER_VIRTUAL_TOP,
};
use crate::error::{VmError, VmResult};
use crate::page::PageStatus;
use crate::platform::AllocFlags;
use crate::space::AddressSpace;
use crate::vm::Vm;

/// Upper bound on user stack growth (8 MiB below the top of user space).
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// How far below the stack pointer a fault may land and still count as
/// stack growth. Covers instructions that move the stack pointer after
/// the access they imply (e.g. a 32-byte push-all).
const STACK_SLACK: usize = 32;

/// A page fault as reported by the architecture trap handler.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// The faulting virtual address.
    pub addr: usize,
    /// Whether the access was a write.
    pub write: bool,
    /// Whether the fault occurred in user mode.
    pub user: bool,
    /// The user stack pointer at fault time, when the trap handler has it
    /// (always for user-mode faults; for kernel-mode faults only if the
    /// syscall path stashed it).
    pub stack_pointer: Option<usize>,
}

/// Outcome of the install step of a materialisation.
enum Installed {
    /// Mapping installed, entry updated.
    Done,
    /// A racing fault made the page resident first.
    Raced,
    /// The entry disappeared while the page was being populated.
    Vanished,
    /// The page directory refused the mapping.
    NoRoom,
}

impl Vm {
    /// Classify and resolve a page fault.
    ///
    /// Kernel-range addresses, write faults against read-only pages, and
    /// addresses no installer ever mentioned are rejected; a fault just
    /// below the live stack installs a fresh zero page first.
    pub fn handle_fault(&self, space: &Arc<AddressSpace>, info: &FaultInfo) -> VmResult<()> {
        let addr = info.addr;
        if !is_user_vaddr(addr) {
            return Err(VmError::KernelAddress { addr });
        }
        let upage = UserPage::containing(addr);
        trace!(
            "[FAULT] addr={:#x} write={} user={}",
            addr,
            info.write,
            info.user
        );

        let known = {
            let pages = space.pages.lock();
            pages.find(upage).map(|entry| entry.can_write())
        };
        match known {
            Some(writable) => {
                if info.write && !writable {
                    return Err(VmError::ReadOnlyPage { addr });
                }
                self.load_page(space, upage)
            }
            None => {
                if Self::grows_stack(addr, info.stack_pointer) {
                    space.install_zeropage(upage);
                    return self.load_page(space, upage);
                }
                Err(VmError::UnmappedPage { addr })
            }
        }
    }

    /// Make `upage` resident and mapped in `space`.
    ///
    /// Succeeds trivially when the page is already resident (racing
    /// faults). Fails when the page is unknown or cannot be materialised;
    /// any partially allocated frame is reclaimed first.
    pub fn load_page(&self, space: &Arc<AddressSpace>, upage: UserPage) -> VmResult<()> {
        self.load_page_inner(space, upage, false)
    }

    /// Fault in every page overlapping `[buf, buf + len)` and pin it.
    ///
    /// Used around kernel I/O into user buffers, so the I/O path cannot
    /// fault while holding the filesystem lock. On failure the pages
    /// already pinned are released again.
    pub fn pin_user_buffer(
        &self,
        space: &Arc<AddressSpace>,
        buf: usize,
        len: usize,
    ) -> VmResult<()> {
        let mut pinned = Vec::new();
        for upage in Self::buffer_pages(buf, len) {
            if let Err(err) = self.load_page_inner(space, upage, true) {
                for &done in &pinned {
                    self.unpin_resident(space, done);
                }
                return Err(err);
            }
            pinned.push(upage);
        }
        Ok(())
    }

    /// Release the pins taken by [`pin_user_buffer`](Self::pin_user_buffer).
    pub fn unpin_user_buffer(&self, space: &Arc<AddressSpace>, buf: usize, len: usize) {
        for upage in Self::buffer_pages(buf, len) {
            self.unpin_resident(space, upage);
        }
    }

    /// Pin a user buffer and get a guard that unpins it on drop.
    pub fn pin_for_io<'a>(
        &'a self,
        space: &Arc<AddressSpace>,
        buf: usize,
        len: usize,
    ) -> VmResult<IoPin<'a>> {
        self.pin_user_buffer(space, buf, len)?;
        Ok(IoPin {
            vm: self,
            space: Arc::clone(space),
            buf,
            len,
        })
    }

    pub(crate) fn load_page_inner(
        &self,
        space: &Arc<AddressSpace>,
        upage: UserPage,
        keep_pinned: bool,
    ) -> VmResult<()> {
        loop {
            let status = {
                let pages = space.pages.lock();
                match pages.find(upage) {
                    None => {
                        return Err(VmError::UnmappedPage {
                            addr: upage.addr(),
                        })
                    }
                    Some(entry) => entry.status.clone(),
                }
            };

            if let PageStatus::OnFrame { .. } = status {
                if !keep_pinned {
                    return Ok(());
                }
                if self.try_pin_resident(space, upage).is_some() {
                    return Ok(());
                }
                // Evicted between the lookup and the pin; bring it back.
                continue;
            }

            if self.materialise(space, upage, status, keep_pinned)? {
                return Ok(());
            }
            // A racing fault installed the page first and we still need a
            // pin; loop to take it from the winner's frame.
        }
    }

    /// Allocate, populate, map, and publish one page. Returns `Ok(false)`
    /// when a racing fault won and the caller still needs to pin.
    fn materialise(
        &self,
        space: &Arc<AddressSpace>,
        upage: UserPage,
        status: PageStatus,
        keep_pinned: bool,
    ) -> VmResult<bool> {
        let mut flags = AllocFlags::USER;
        if matches!(status, PageStatus::AllZeros) {
            flags |= AllocFlags::ZERO;
        }
        // Born pinned; may evict another frame.
        let kpage = self.frames.lock().alloc(flags, upage, space);

        match &status {
            // The allocator already zero-filled the frame.
            PageStatus::AllZeros => {}
            PageStatus::OnSwap { slot } => {
                // Releases the slot as part of the read.
                self.swap.lock().read_in(*slot, kpage);
            }
            PageStatus::FromFile {
                file,
                offset,
                read_bytes,
                ..
            } => {
                // SAFETY: the frame is born pinned and not yet mapped, so
                // it is exclusively ours while we fill it.
                let bytes = unsafe { kpage.bytes_mut() };
                let got = file.read_at(&mut bytes[..*read_bytes], *offset);
                if got < *read_bytes {
                    self.frames.lock().free(kpage);
                    return Err(VmError::ShortRead {
                        addr: upage.addr(),
                        expected: *read_bytes,
                        got,
                    });
                }
                bytes[*read_bytes..].fill(0);
            }
            PageStatus::OnFrame { .. } => {
                unreachable!("resident pages are handled before allocation")
            }
        }

        let writable = match &status {
            PageStatus::FromFile { writable, .. } => *writable,
            // Zero and swapped pages always map writable.
            _ => true,
        };

        let pd = space.pagedir();
        let installed = {
            let mut pages = space.pages.lock();
            match pages.find_mut(upage) {
                None => Installed::Vanished,
                Some(entry) if entry.is_resident() => Installed::Raced,
                Some(entry) => {
                    if pd.set_page(upage, kpage, writable) {
                        entry.status = PageStatus::OnFrame { kpage, writable };
                        Installed::Done
                    } else {
                        Installed::NoRoom
                    }
                }
            }
        };

        match installed {
            Installed::Done => {
                // A freshly loaded page is clean by convention.
                pd.set_dirty(upage.addr(), false);
                if !keep_pinned {
                    self.frames.lock().unpin(kpage);
                }
                debug!(
                    "[FAULT] loaded {:#x} into {:#x} (writable={})",
                    upage.addr(),
                    kpage.addr(),
                    writable
                );
                Ok(true)
            }
            Installed::Raced => {
                self.frames.lock().free(kpage);
                Ok(!keep_pinned)
            }
            Installed::Vanished => {
                self.frames.lock().free(kpage);
                Err(VmError::UnmappedPage {
                    addr: upage.addr(),
                })
            }
            Installed::NoRoom => {
                self.frames.lock().free(kpage);
                Err(VmError::MapInstallFailed {
                    addr: upage.addr(),
                })
            }
        }
    }

    /// Pin the page's frame if (and only if) it is resident right now.
    /// Takes the frame lock before the SPT lock so the residency check and
    /// the pin are one atomic step against eviction.
    pub(crate) fn try_pin_resident(
        &self,
        space: &Arc<AddressSpace>,
        upage: UserPage,
    ) -> Option<KernelPage> {
        let mut frames = self.frames.lock();
        let pages = space.pages.lock();
        match pages.find(upage) {
            Some(entry) => match &entry.status {
                PageStatus::OnFrame { kpage, .. } => {
                    frames.pin(*kpage);
                    Some(*kpage)
                }
                _ => None,
            },
            None => None,
        }
    }

    /// Unpin the frame of a page that must be resident (it is pinned, so
    /// nothing can have evicted it). Anything else is a kernel bug.
    fn unpin_resident(&self, space: &Arc<AddressSpace>, upage: UserPage) {
        let mut frames = self.frames.lock();
        let pages = space.pages.lock();
        match pages.find(upage).map(|entry| &entry.status) {
            Some(PageStatus::OnFrame { kpage, .. }) => frames.unpin(*kpage),
            _ => panic!(
                "[FAULT] unpin of non-resident page {:#x}",
                upage.addr()
            ),
        }
    }

    fn grows_stack(addr: usize, stack_pointer: Option<usize>) -> bool {
        let Some(sp) = stack_pointer else {
            return false;
        };
        addr >= USER_VIRTUAL_TOP - MAX_STACK_SIZE && addr >= sp.saturating_sub(STACK_SLACK)
    }

    fn buffer_pages(buf: usize, len: usize) -> impl Iterator<Item = UserPage> {
        let start = page_round_down(buf);
        let end = if len == 0 { start } else { buf + len };
        (start..end).step_by(PAGE_SIZE).map(UserPage::containing)
    }
}

/// RAII pin over a user buffer; unpins on drop.
pub struct IoPin<'a> {
    vm: &'a Vm,
    space: Arc<AddressSpace>,
    buf: usize,
    len: usize,
}

impl Drop for IoPin<'_> {
    fn drop(&mut self) {
        self.vm.unpin_user_buffer(&self.space, self.buf, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;
    use crate::sim::{SimDisk, SimFile, SimFrames, SimPageDir};
    use crate::swap::SECTORS_PER_PAGE;
    use alloc::vec;

    fn core(frames: usize) -> (Vm, Arc<SimPageDir>, Arc<AddressSpace>) {
        let phys = Arc::new(SimFrames::new(frames));
        let disk = Arc::new(SimDisk::new(64 * SECTORS_PER_PAGE as u64));
        let vm = Vm::new(phys, disk);
        let pd = Arc::new(SimPageDir::new());
        let space = AddressSpace::new(pd.clone());
        (vm, pd, space)
    }

    fn upage(addr: usize) -> UserPage {
        UserPage::new(addr).unwrap()
    }

    #[test]
    fn test_demand_zero_page() {
        let (vm, pd, space) = core(4);
        let up = upage(0x0804_8000);
        space.install_zeropage(up);

        let swap_before = vm.swap_stats();
        vm.load_page(&space, up).unwrap();

        let mut buf = [0xFFu8; 64];
        assert!(pd.user_read(up.addr(), &mut buf));
        assert!(buf.iter().all(|&b| b == 0));

        assert_eq!(vm.swap_stats(), swap_before);
        let snapshot = space.page_snapshot();
        assert_eq!(snapshot[0].kind, PageKind::OnFrame);
        // The fresh frame is unpinned once installed.
        assert!(!vm.frame_snapshot()[0].pinned);
    }

    #[test]
    fn test_load_is_idempotent() {
        let (vm, _pd, space) = core(4);
        let up = upage(0x1000);
        space.install_zeropage(up);
        vm.load_page(&space, up).unwrap();

        let before = vm.frame_snapshot();
        vm.load_page(&space, up).unwrap();
        let after = vm.frame_snapshot();

        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].kpage, after[0].kpage);
    }

    #[test]
    fn test_unknown_page_fails() {
        let (vm, _pd, space) = core(4);
        assert_eq!(
            vm.load_page(&space, upage(0x7000)),
            Err(VmError::UnmappedPage { addr: 0x7000 })
        );
    }

    #[test]
    fn test_file_backed_load_fills_and_zeros() {
        let (vm, pd, space) = core(4);
        let up = upage(0x2000);
        let file: Arc<dyn crate::platform::MappedFile> =
            Arc::new(SimFile::new(vec![0xAB; 100]));
        space.install_filesys(up, file, 0, 100, PAGE_SIZE - 100, false);

        vm.load_page(&space, up).unwrap();

        let mut buf = [0u8; 128];
        assert!(pd.user_read(up.addr(), &mut buf));
        assert!(buf[..100].iter().all(|&b| b == 0xAB));
        assert!(buf[100..].iter().all(|&b| b == 0));

        // Read-only file pages map read-only.
        assert!(!pd.user_write(up.addr(), &[1]));
    }

    #[test]
    fn test_short_read_reclaims_frame() {
        let (vm, _pd, space) = core(4);
        let up = upage(0x2000);
        // File too short for the promised read_bytes.
        let file: Arc<dyn crate::platform::MappedFile> =
            Arc::new(SimFile::new(vec![1u8; 10]));
        space.install_filesys(up, file, 0, 100, PAGE_SIZE - 100, true);

        assert_eq!(
            vm.load_page(&space, up),
            Err(VmError::ShortRead {
                addr: 0x2000,
                expected: 100,
                got: 10
            })
        );
        assert_eq!(vm.frame_count(), 0);
    }

    #[test]
    fn test_pagedir_rejection_reclaims_frame() {
        let (vm, pd, space) = core(4);
        let up = upage(0x3000);
        space.install_zeropage(up);
        pd.set_install_failure(true);

        assert_eq!(
            vm.load_page(&space, up),
            Err(VmError::MapInstallFailed { addr: 0x3000 })
        );
        assert_eq!(vm.frame_count(), 0);

        // The entry survives; a later fault succeeds.
        pd.set_install_failure(false);
        vm.load_page(&space, up).unwrap();
        assert_eq!(vm.frame_count(), 1);
    }

    #[test]
    fn test_swap_cycle_round_trips_data() {
        let (vm, pd, space) = core(2);
        // Fill both frames with distinct patterns.
        for i in 0..2 {
            let up = upage(0x1000 + i * PAGE_SIZE);
            space.install_zeropage(up);
            vm.load_page(&space, up).unwrap();
            assert!(pd.user_write(up.addr(), &[i as u8 + 10; 16]));
        }

        // A third page forces an eviction.
        let third = upage(0x8000);
        space.install_zeropage(third);
        vm.load_page(&space, third).unwrap();
        assert_eq!(vm.swap_stats().used, 1);

        // Fault the evicted page back in and check its bytes survived. The
        // reload displaces another page, but the original slot comes free.
        let evicted = space
            .page_snapshot()
            .into_iter()
            .find(|p| p.kind == PageKind::OnSwap)
            .unwrap();
        let old_slot = evicted.slot.unwrap();
        vm.load_page(&space, evicted.upage).unwrap();
        assert!(!vm.swap_is_occupied(old_slot));
        assert_eq!(vm.swap_stats().used, 1);

        let expected = if evicted.upage == upage(0x1000) { 10 } else { 11 };
        let mut buf = [0u8; 16];
        assert!(pd.user_read(evicted.upage.addr(), &mut buf));
        assert!(buf.iter().all(|&b| b == expected));
    }

    #[test]
    fn test_handle_fault_rejects_kernel_address() {
        let (vm, _pd, space) = core(4);
        let info = FaultInfo {
            addr: USER_VIRTUAL_TOP + 0x1000,
            write: false,
            user: true,
            stack_pointer: None,
        };
        assert!(matches!(
            vm.handle_fault(&space, &info),
            Err(VmError::KernelAddress { .. })
        ));
    }

    #[test]
    fn test_handle_fault_rejects_write_to_readonly() {
        let (vm, _pd, space) = core(4);
        let up = upage(0x2000);
        let file: Arc<dyn crate::platform::MappedFile> =
            Arc::new(SimFile::new(vec![0u8; 100]));
        space.install_filesys(up, file, 0, 100, PAGE_SIZE - 100, false);
        vm.load_page(&space, up).unwrap();

        let info = FaultInfo {
            addr: up.addr() + 4,
            write: true,
            user: true,
            stack_pointer: None,
        };
        assert_eq!(
            vm.handle_fault(&space, &info),
            Err(VmError::ReadOnlyPage { addr: up.addr() + 4 })
        );
        // A read fault on the same resident page is not an error.
        let read = FaultInfo {
            write: false,
            ..info
        };
        vm.handle_fault(&space, &read).unwrap();
    }

    #[test]
    fn test_handle_fault_grows_stack() {
        let (vm, pd, space) = core(4);
        let sp = USER_VIRTUAL_TOP - 0x2000;
        // Push just below the stack pointer.
        let info = FaultInfo {
            addr: sp - 32,
            write: true,
            user: true,
            stack_pointer: Some(sp),
        };
        vm.handle_fault(&space, &info).unwrap();
        assert!(space.has_entry(UserPage::containing(sp - 32)));
        assert!(pd.user_write(sp - 32, &[0x5A]));

        // Far below the stack pointer is not growth.
        let wild = FaultInfo {
            addr: sp - 0x10_0000,
            write: true,
            user: true,
            stack_pointer: Some(sp),
        };
        assert!(matches!(
            vm.handle_fault(&space, &wild),
            Err(VmError::UnmappedPage { .. })
        ));
    }

    #[test]
    fn test_pinned_buffer_survives_memory_pressure() {
        let (vm, _pd, space) = core(3);
        // A three-page buffer, pinned for I/O.
        let buf = 0x1_0000;
        for i in 0..3 {
            space.install_zeropage(upage(buf + i * PAGE_SIZE));
        }
        vm.pin_user_buffer(&space, buf + 100, 2 * PAGE_SIZE + 100)
            .unwrap();
        assert!(vm.frame_snapshot().iter().all(|f| f.pinned));

        // All frames are pinned: allocation for a fourth page must die on
        // the clock scan rather than evict part of the buffer.
        space.install_zeropage(upage(0x9000));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = vm.load_page(&space, upage(0x9000));
        }));
        assert!(result.is_err());

        vm.unpin_user_buffer(&space, buf + 100, 2 * PAGE_SIZE + 100);
        assert!(vm.frame_snapshot().iter().all(|f| !f.pinned));
    }

    #[test]
    fn test_io_pin_guard_unpins_on_drop() {
        let (vm, _pd, space) = core(2);
        space.install_zeropage(upage(0x4000));
        {
            let _pin = vm.pin_for_io(&space, 0x4000, 64).unwrap();
            assert!(vm.frame_snapshot()[0].pinned);
        }
        assert!(!vm.frame_snapshot()[0].pinned);
    }

    #[test]
    fn test_pin_failure_rolls_back() {
        let (vm, _pd, space) = core(4);
        space.install_zeropage(upage(0x4000));
        // Second page of the buffer is unknown.
        let err = vm
            .pin_user_buffer(&space, 0x4000, 2 * PAGE_SIZE)
            .unwrap_err();
        assert!(matches!(err, VmError::UnmappedPage { .. }));
        // The first page's pin was rolled back.
        assert!(vm.frame_snapshot().iter().all(|f| !f.pinned));
    }
}
