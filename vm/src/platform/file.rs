//! Filesystem file interface.

use alloc::sync::Arc;

/// A file as the memory-mapping and demand-paging code sees it.
///
/// Offsets are absolute; there is no shared seek cursor between handles.
/// Files do not grow: a write past the current length is truncated to the
/// bytes that fit, and the number of bytes actually transferred is
/// returned. This mirrors the surrounding filesystem, which has no file
/// extension.
pub trait MappedFile: Send + Sync {
    /// Open an independent handle to the same underlying file, so that the
    /// mapping survives the user closing their descriptor.
    fn reopen(&self) -> Arc<dyn MappedFile>;

    /// Current length of the file in bytes.
    fn len(&self) -> u64;

    /// Whether the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes starting at `offset`; returns the
    /// number of bytes read (short at end of file).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes starting at `offset`, without growing
    /// the file; returns the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;
}
