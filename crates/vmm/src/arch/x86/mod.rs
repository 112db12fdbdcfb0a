//! x86 (i386-style two-level paging) hardware implementation.
//!
//! 4 KiB pages, a 1024-entry page directory and 1024-entry page tables of
//! 32-bit entries. Kernel space occupies the top quarter of the address space
//! (3 GiB and up); the topmost directory slots are reserved for the
//! per-address-space kernel stack, the per-CPU temp-map area, the foreign-map
//! window, and the recursive self-mapping.
//!
//! On hardware the recursive mapping does the heavy lifting: window virtual
//! addresses are resolved by the MMU itself, so [`window_ptr`] is a cast.

// Compiled during tests (for type checking) but only used on hardware.
#![allow(dead_code)]

mod entry;
mod flags;
mod table;

use core::arch::asm;

use crate::{FrameNumber, VirtualAddress};

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::TableRef;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in a page table or page directory.
pub const ENTRY_COUNT: usize = 1024;

/// Size of one page table entry in bytes.
pub const ENTRY_SIZE: usize = core::mem::size_of::<PageEntry>();

/// Number of bits in a directory or table index.
pub const INDEX_BITS: usize = 10;

/// Bit position of the page-table index within a virtual address.
pub const TABLE_INDEX_SHIFT: usize = 12;

/// Bit position of the page-directory index within a virtual address.
pub const DIR_INDEX_SHIFT: usize = TABLE_INDEX_SHIFT + INDEX_BITS;

// One page table must fill exactly one frame for the self-map to work.
const _: () = assert!(ENTRY_COUNT * ENTRY_SIZE == PAGE_SIZE);

/// First directory slot belonging to kernel space (3 GiB split).
pub const KERNEL_SPACE_SLOT: usize = 768;

/// Directory slot holding the per-address-space kernel-stack table.
pub const KERNEL_STACK_SLOT: usize = 1020;

/// Directory slot holding the per-CPU temporary mapping area.
pub const TEMP_MAP_SLOT: usize = 1021;

/// Directory slot reserved for the foreign-map window.
pub const FOREIGN_MAP_SLOT: usize = 1022;

/// Directory slot reserved for the recursive self-mapping.
pub const SELF_MAP_SLOT: usize = 1023;

/// Maximum number of CPUs (bounded by the temp-map area: one page per CPU).
pub const MAX_CPUS: usize = 8;

/// Returns the page-directory index of a virtual address.
#[inline]
pub const fn dir_index(address: usize) -> usize {
    (address >> DIR_INDEX_SHIFT) & (ENTRY_COUNT - 1)
}

/// Returns the page-table index of a virtual address.
#[inline]
pub const fn table_index(address: usize) -> usize {
    (address >> TABLE_INDEX_SHIFT) & (ENTRY_COUNT - 1)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Validates a virtual address: the full 32-bit space is addressable.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Canonicalizes a virtual address (a no-op within the 32-bit space).
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    addr & 0xFFFF_FFFF
}

/// Returns the base virtual address covered by the given directory slot.
#[inline]
pub const fn slot_base(slot: usize) -> VirtualAddress {
    VirtualAddress::new(slot << DIR_INDEX_SHIFT)
}

/// Invalidates the TLB entry for one page on the current CPU.
pub fn invalidate_page(virt: VirtualAddress) {
    // SAFETY: invlpg has no side effects beyond dropping a TLB entry.
    unsafe {
        asm!("invlpg [{}]", in(reg) virt.as_usize(), options(nostack, preserves_flags));
    }
}

/// Invalidates the TLB entries covering a multi-page range.
pub fn invalidate_range(base: VirtualAddress, pages: usize) {
    for page in 0..pages {
        invalidate_page(base + page * PAGE_SIZE);
    }
}

/// Activates the address space rooted at the given directory frame.
///
/// Reloading CR3 drops all non-global TLB entries as a side effect.
pub fn activate(root: FrameNumber) {
    // SAFETY: the caller guarantees the directory maps the kernel and itself.
    unsafe {
        asm!("mov cr3, {}", in(reg) root.start().as_usize(), options(nostack, preserves_flags));
    }
}

/// Resolves a window virtual address of the active address space to a
/// pointer.
///
/// The recursive mapping makes window addresses directly dereferenceable;
/// the MMU performs the walk, so the root is implicit in CR3.
pub(crate) fn window_ptr(_root: FrameNumber, virt: VirtualAddress) -> *mut u8 {
    virt.as_mut_ptr()
}
