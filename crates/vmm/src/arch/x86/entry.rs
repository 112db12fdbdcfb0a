//! Page table entry for x86.

use crate::FrameNumber;

use super::flags::PageFlags;

/// A single page table entry for x86 two-level paging.
///
/// 32-bit entries: bits 12-31 hold the frame address, bits 0-11 the flags
/// (hardware bits plus the software-available bits 9-11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Physical address mask (bits 12-31).
    const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// Creates a new page table entry mapping the given frame.
    ///
    /// The exists bit is always set: writing an entry allocates its slot.
    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        debug_assert!(
            !flags.is_copy_on_write() || (flags.is_present() && !flags.is_writable()),
            "copy-on-write entries must be present and read-only"
        );

        let addr = (frame.as_usize() as u32) << super::TABLE_INDEX_SHIFT;
        let mut flags = flags;
        flags.set_exists(true);
        Self((addr & Self::ADDRESS_MASK) | flags.to_raw())
    }

    /// Creates an empty entry: slot not allocated.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the frame number stored in this entry.
    ///
    /// Only meaningful when the entry exists.
    pub fn frame(self) -> FrameNumber {
        FrameNumber::new(((self.0 & Self::ADDRESS_MASK) >> super::TABLE_INDEX_SHIFT) as usize)
    }

    /// Returns the flags of this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0)
    }

    /// Returns whether the slot is allocated.
    pub fn exists(self) -> bool {
        self.flags().exists()
    }

    /// Returns whether this entry maps a valid frame.
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::empty()
    }
}
