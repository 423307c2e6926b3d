//! Shared harness for the integration suite: boots a core over the
//! in-memory devices and emulates the MMU retry loop a real fault handler
//! sits in.

#![allow(dead_code)]

use std::sync::Arc;

use cinder_vm::sim::{SimDisk, SimFrames, SimPageDir};
use cinder_vm::swap::SECTORS_PER_PAGE;
use cinder_vm::{AddressSpace, FaultInfo, PageKind, Vm, VmResult};

/// A core plus a handle on its physical pool.
pub struct Kernel {
    pub vm: Vm,
    pub frames: Arc<SimFrames>,
}

/// One simulated process: an address space and its page directory.
pub struct Proc {
    pub pd: Arc<SimPageDir>,
    pub space: Arc<AddressSpace>,
}

/// Boot a core with `frame_count` user frames and `swap_slots` swap slots.
pub fn boot(frame_count: usize, swap_slots: usize) -> Kernel {
    let frames = Arc::new(SimFrames::new(frame_count));
    let disk = Arc::new(SimDisk::new((swap_slots * SECTORS_PER_PAGE) as u64));
    Kernel {
        vm: Vm::new(frames.clone(), disk),
        frames,
    }
}

/// Create a process with an empty address space.
pub fn spawn() -> Proc {
    let pd = Arc::new(SimPageDir::new());
    Proc {
        space: AddressSpace::new(pd.clone()),
        pd,
    }
}

/// Store `bytes` at `addr` the way user code would: attempt the access,
/// let the fault handler resolve a miss, retry.
pub fn user_store(vm: &Vm, proc: &Proc, addr: usize, bytes: &[u8]) -> VmResult<()> {
    for _ in 0..2 {
        if proc.pd.user_write(addr, bytes) {
            return Ok(());
        }
        vm.handle_fault(
            &proc.space,
            &FaultInfo {
                addr,
                write: true,
                user: true,
                stack_pointer: None,
            },
        )?;
    }
    panic!("store at {:#x} still faults after resolution", addr);
}

/// Load `buf.len()` bytes from `addr` with the same retry loop.
pub fn user_load(vm: &Vm, proc: &Proc, addr: usize, buf: &mut [u8]) -> VmResult<()> {
    for _ in 0..2 {
        if proc.pd.user_read(addr, buf) {
            return Ok(());
        }
        vm.handle_fault(
            &proc.space,
            &FaultInfo {
                addr,
                write: false,
                user: true,
                stack_pointer: None,
            },
        )?;
    }
    panic!("load at {:#x} still faults after resolution", addr);
}

/// Cross-check the frame table, the page tables, the page directories,
/// and the swap bitmap of every process against each other.
pub fn check_invariants(vm: &Vm, procs: &[&Proc]) {
    let frames = vm.frame_snapshot();

    for frame in &frames {
        let Some(proc) = procs
            .iter()
            .find(|p| Arc::ptr_eq(&p.space, &frame.owner))
        else {
            continue;
        };
        let pages = proc.space.page_snapshot();
        let entry = pages
            .iter()
            .find(|p| p.upage == frame.upage)
            .unwrap_or_else(|| {
                panic!(
                    "frame {:#x} has no page entry for {:#x}",
                    frame.kpage.addr(),
                    frame.upage.addr()
                )
            });
        assert_eq!(entry.kind, PageKind::OnFrame);
        assert_eq!(entry.kpage, Some(frame.kpage));
        let (mapped, _writable) = proc
            .pd
            .translate(frame.upage.addr())
            .expect("resident page must be mapped");
        assert_eq!(mapped, frame.kpage);
    }

    for proc in procs {
        for page in proc.space.page_snapshot() {
            if page.kind != PageKind::OnSwap {
                continue;
            }
            let slot = page.slot.expect("swapped page records its slot");
            assert!(
                vm.swap_is_occupied(slot),
                "page {:#x} points at a free swap slot",
                page.upage.addr()
            );
            assert!(
                !frames
                    .iter()
                    .any(|f| f.upage == page.upage && Arc::ptr_eq(&f.owner, &proc.space)),
                "page {:#x} is both swapped and resident",
                page.upage.addr()
            );
        }
    }
}
