//! Physical page allocator interface.

use bitflags::bitflags;

use crate::addr::KernelPage;

bitflags! {
    /// Allocation request flags, mirroring the kernel pool split.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Return the frame zero-filled.
        const ZERO = 1 << 1;
    }
}

/// The low-level physical page allocator.
///
/// # Safety
///
/// Implementations must uphold the frame contract the core's unsafe code
/// relies on:
///
/// - every address returned by [`get_page`](Self::get_page) is page-aligned
///   and valid for `PAGE_SIZE` bytes of reads and writes;
/// - a returned frame is exclusively owned by the caller until it is passed
///   back to [`free_page`](Self::free_page) -- the allocator neither reads
///   nor writes it in between, and never hands it out twice;
/// - when [`AllocFlags::ZERO`] is requested, the frame's bytes are zero on
///   return.
pub unsafe trait FrameSource: Send + Sync {
    /// Obtain one physical frame, or `None` when the pool is exhausted.
    fn get_page(&self, flags: AllocFlags) -> Option<KernelPage>;

    /// Return a frame previously handed out by [`get_page`](Self::get_page).
    fn free_page(&self, kpage: KernelPage);
}
