//! Hardware page directory interface.

use crate::addr::{KernelPage, UserPage};

/// One process's hardware page directory.
///
/// The core installs and removes translations through this trait and
/// inspects the accessed/dirty bits the hardware maintains. Methods take
/// `&self`; implementations serialise internally (the hardware equivalent
/// mutates in place under the processor's own rules).
pub trait PageDirectory: Send + Sync {
    /// Map `upage` to `kpage` with the given write permission. Returns
    /// `false` when the directory cannot install the mapping (e.g. interior
    /// page-table allocation failed).
    fn set_page(&self, upage: UserPage, kpage: KernelPage, writable: bool) -> bool;

    /// Remove the translation for `upage`. Subsequent accesses fault. The
    /// accessed/dirty bits recorded for the page remain readable.
    fn clear_page(&self, upage: UserPage);

    /// Whether the hardware has seen an access to `upage` since the bit was
    /// last cleared.
    fn is_accessed(&self, upage: UserPage) -> bool;

    /// Set or clear the accessed bit for `upage`.
    fn set_accessed(&self, upage: UserPage, accessed: bool);

    /// Whether the hardware has seen a write through `addr` since the bit
    /// was last cleared. `addr` may be a user address or the kernel alias
    /// of a frame -- both views of a frame carry their own bit.
    fn is_dirty(&self, addr: usize) -> bool;

    /// Set or clear the dirty bit for `addr` (user address or kernel
    /// alias).
    fn set_dirty(&self, addr: usize, dirty: bool);
}
