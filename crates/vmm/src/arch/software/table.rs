//! Page table access for software emulation.

use crate::{FrameNumber, address::AddressTranslator};

use super::{ENTRY_COUNT, entry::PageEntry};

/// A borrowed view of one page table (or page directory) living in a frame.
///
/// A page table is not a Rust-owned object: it is PAGE_SIZE bytes of some
/// physical frame, reached either through the emulated physical memory (here)
/// or through a paging window. `TableRef` wraps the resolved pointer with
/// bounds-checked entry access.
///
/// All mutation happens under the global paging lock, which is what makes the
/// aliased raw pointers sound.
pub struct TableRef {
    base: *mut PageEntry,
}

impl TableRef {
    /// Creates a table view over the given frame.
    ///
    /// # Safety
    /// The frame must hold a page table (or directory) and stay alive for the
    /// duration of the borrow.
    pub unsafe fn from_frame(frame: FrameNumber) -> Self {
        let translator = AddressTranslator::current();
        Self {
            base: translator.phys_to_ptr(frame.start().as_usize()),
        }
    }

    /// Creates a table view over an already-resolved pointer (e.g. a frame
    /// mapped through the temp window).
    ///
    /// # Safety
    /// The pointer must reference PAGE_SIZE bytes holding a page table.
    pub unsafe fn from_ptr(ptr: *mut u8) -> Self {
        Self {
            base: ptr as *mut PageEntry,
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: index is in bounds and the table outlives self.
        unsafe { *self.base.add(index) }
    }

    /// Writes the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn set_entry(&self, index: usize, entry: PageEntry) {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: index is in bounds and the table outlives self.
        unsafe { *self.base.add(index) = entry };
    }

    /// Returns true if no slot in this table is allocated.
    pub fn is_empty(&self) -> bool {
        (0..ENTRY_COUNT).all(|i| !self.entry(i).exists())
    }

    /// Clears every entry.
    pub fn zero(&self) {
        for i in 0..ENTRY_COUNT {
            self.set_entry(i, PageEntry::empty());
        }
    }
}
