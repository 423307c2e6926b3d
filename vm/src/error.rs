//! Error types for the virtual-memory core.
//!
//! Fallible operations return [`VmResult`]. Conditions the core treats as
//! kernel bugs (double-free of a swap slot, pinning an unknown frame,
//! duplicate page installs) panic instead: they indicate a contract breach
//! inside the kernel, not a recoverable situation.

use core::fmt;

/// Main error type of the virtual-memory core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "vm errors must be handled, not silently discarded"]
pub enum VmError {
    /// Fault on a user page the address space knows nothing about.
    UnmappedPage { addr: usize },
    /// Fault on an address outside the user virtual range.
    KernelAddress { addr: usize },
    /// Write fault against a page mapped (or destined to be mapped)
    /// read-only.
    ReadOnlyPage { addr: usize },
    /// A frame install found an existing entry for the page.
    DuplicatePage { addr: usize },
    /// A file-backed page could not be read in full.
    ShortRead {
        addr: usize,
        expected: usize,
        got: usize,
    },
    /// The hardware page directory refused the mapping.
    MapInstallFailed { addr: usize },
    /// Mapping address is null or not page-aligned.
    BadMapAddress { addr: usize },
    /// Mapping a zero-length file.
    EmptyFile,
    /// The requested range collides with an existing page.
    MapOverlap { addr: usize },
    /// Unmap of a mapping id this address space never handed out.
    UnknownMapping { id: u32 },
}

/// Result type alias for vm operations.
pub type VmResult<T> = Result<T, VmError>;

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmappedPage { addr } => write!(f, "unmapped user page at {:#x}", addr),
            Self::KernelAddress { addr } => {
                write!(f, "fault on kernel address {:#x}", addr)
            }
            Self::ReadOnlyPage { addr } => {
                write!(f, "write to read-only page at {:#x}", addr)
            }
            Self::DuplicatePage { addr } => {
                write!(f, "page at {:#x} is already installed", addr)
            }
            Self::ShortRead {
                addr,
                expected,
                got,
            } => write!(
                f,
                "short read for page {:#x}: wanted {} bytes, got {}",
                addr, expected, got
            ),
            Self::MapInstallFailed { addr } => {
                write!(f, "page directory rejected mapping for {:#x}", addr)
            }
            Self::BadMapAddress { addr } => {
                write!(f, "invalid mapping address {:#x}", addr)
            }
            Self::EmptyFile => write!(f, "cannot map an empty file"),
            Self::MapOverlap { addr } => {
                write!(f, "mapping overlaps existing page at {:#x}", addr)
            }
            Self::UnknownMapping { id } => write!(f, "unknown mapping id {}", id),
        }
    }
}
