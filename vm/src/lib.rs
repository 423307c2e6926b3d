//! CinderOS virtual-memory core.
//!
//! This crate backs a user process's address space with a mix of physical
//! frames, a swap device, zero pages, and file-backed pages, and keeps a
//! bounded pool of frames productive under memory pressure with a
//! second-chance (clock) eviction policy.
//!
//! The moving parts:
//!
//! - [`FrameTable`](frame::FrameTable) -- every resident user frame, the
//!   clock hand, and pinning (internal; reached through [`Vm`]);
//! - [`SuppPageTable`](page::SuppPageTable) -- per-address-space record of
//!   how each known user page is backed;
//! - [`SwapStore`](swap::SwapStore) -- bitmap-managed page slots on a block
//!   device;
//! - [`Vm::load_page`] -- the fault resolution protocol tying them
//!   together;
//! - [`Vm::mmap`] / [`Vm::munmap`] -- the memory-mapped file lifecycle.
//!
//! The surrounding kernel's services live behind the [`platform`] traits;
//! [`sim`] has in-memory stand-ins for all of them, so a complete core can
//! be built in a handful of lines:
//!
//! ```
//! use std::sync::Arc;
//!
//! use cinder_vm::sim::{SimDisk, SimFrames, SimPageDir};
//! use cinder_vm::{AddressSpace, UserPage, Vm};
//!
//! let vm = Vm::new(Arc::new(SimFrames::new(4)), Arc::new(SimDisk::new(64)));
//! let pagedir = Arc::new(SimPageDir::new());
//! let space = AddressSpace::new(pagedir.clone());
//!
//! let stack = UserPage::new(0xbfff_e000).unwrap();
//! space.install_zeropage(stack);
//! vm.load_page(&space, stack).unwrap();
//! assert!(pagedir.user_write(stack.addr(), b"hello"));
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod error;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod platform;
pub mod sim;
pub mod space;
pub mod swap;
pub mod vm;

pub use addr::{KernelPage, UserPage, PAGE_SIZE, USER_VIRTUAL_TOP};
pub use error::{VmError, VmResult};
pub use fault::{FaultInfo, IoPin, MAX_STACK_SIZE};
pub use frame::FrameSnapshot;
pub use mmap::MapId;
pub use page::{PageKind, PageSnapshot};
pub use platform::{AllocFlags, BlockDevice, FrameSource, MappedFile, PageDirectory};
pub use space::AddressSpace;
pub use swap::{SwapSlot, SwapStats};
pub use vm::Vm;
