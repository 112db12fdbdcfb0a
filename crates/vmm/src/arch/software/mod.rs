//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated architecture that can run on any
//! host. It's designed for testing and development without requiring actual
//! hardware access.
//!
//! The software-emulated architecture is a "scale model" of two-level x86
//! paging:
//! - 15-bit virtual addresses (vs 32-bit on x86)
//! - 16-bit physical addresses
//! - 2 levels: page directory and page table
//! - 4-bit indexes (16 entries per table, vs 10-bit/1024 entries on x86)
//! - 7-bit page offset (128-byte pages, vs 12-bit/4KB on x86)
//!
//! One page table fills exactly one frame, which is what makes the recursive
//! self-mapping work: a directory installed as a page table exposes the page
//! tables it points to as ordinary data pages. The emulated page walk in
//! [`window_ptr`] resolves window addresses through the active directory the
//! same way the hardware MMU would, so the self-map and foreign-map mechanics
//! are exercised for real under test.

mod entry;
mod flags;
mod table;

use core::cell::Cell;

use crate::{FrameNumber, VirtualAddress, address::AddressTranslator};

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::TableRef;

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 15;

/// Page size in bytes (128 bytes = 2^7).
pub const PAGE_SIZE: usize = 128;

/// Number of entries in a page table or page directory.
pub const ENTRY_COUNT: usize = 16;

/// Size of one page table entry in bytes.
pub const ENTRY_SIZE: usize = core::mem::size_of::<PageEntry>();

/// Number of bits in a directory or table index.
pub const INDEX_BITS: usize = 4;

/// Bit position of the page-table index within a virtual address.
pub const TABLE_INDEX_SHIFT: usize = 7;

/// Bit position of the page-directory index within a virtual address.
pub const DIR_INDEX_SHIFT: usize = TABLE_INDEX_SHIFT + INDEX_BITS;

// One page table must fill exactly one frame for the self-map to work.
const _: () = assert!(ENTRY_COUNT * ENTRY_SIZE == PAGE_SIZE);

/// First directory slot belonging to kernel space (the upper half).
pub const KERNEL_SPACE_SLOT: usize = 8;

/// Directory slot holding the per-address-space kernel-stack table.
pub const KERNEL_STACK_SLOT: usize = 12;

/// Directory slot holding the per-CPU temporary mapping area.
pub const TEMP_MAP_SLOT: usize = 13;

/// Directory slot reserved for the foreign-map window.
pub const FOREIGN_MAP_SLOT: usize = 14;

/// Directory slot reserved for the recursive self-mapping.
pub const SELF_MAP_SLOT: usize = 15;

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

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must be canonical: bits 15-63 must be sign-extended
/// from bit 14.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address by sign-extending bit 14 upward.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << (MAX_VIRTUAL_BITS - 1))) != 0 {
        addr | !((1 << MAX_VIRTUAL_BITS) - 1)
    } else {
        addr & ((1 << MAX_VIRTUAL_BITS) - 1)
    }
}

/// Returns the base virtual address covered by the given directory slot.
#[inline]
pub const fn slot_base(slot: usize) -> VirtualAddress {
    VirtualAddress::new(canonicalize_virtual(slot << DIR_INDEX_SHIFT))
}

std::thread_local! {
    static TLB_FLUSHES: Cell<u64> = const { Cell::new(0) };
}

/// Invalidates the TLB entry for one page on the current CPU.
///
/// The emulated MMU holds no translation cache, so this only counts the
/// flush; tests assert on the counter to verify invalidation ordering.
pub fn invalidate_page(_virt: VirtualAddress) {
    TLB_FLUSHES.with(|c| c.set(c.get() + 1));
}

/// Invalidates the TLB entries covering a multi-page range.
pub fn invalidate_range(_base: VirtualAddress, _pages: usize) {
    TLB_FLUSHES.with(|c| c.set(c.get() + 1));
}

/// Returns the number of TLB invalidations issued on the current CPU.
pub fn tlb_flush_count() -> u64 {
    TLB_FLUSHES.with(|c| c.get())
}

/// Activates the address space rooted at the given directory frame.
///
/// The emulated MMU reads the active root from the CPU state on every walk,
/// so there is no hardware register to load here.
pub fn activate(_root: FrameNumber) {}

/// Resolves a virtual address of the *active* address space to a host
/// pointer by walking the page tables the way the MMU would.
///
/// This is how window addresses (self-map, foreign-map, temp-map) are turned
/// into usable pointers under emulation; a window that was not installed
/// correctly fails the walk and panics, which is the emulated equivalent of
/// a kernel page fault in the paging core itself.
pub(crate) fn window_ptr(root: FrameNumber, virt: VirtualAddress) -> *mut u8 {
    // SAFETY: `root` names a live directory frame of the active space.
    let dir = unsafe { TableRef::from_frame(root) };
    let pde = dir.entry(dir_index(virt.as_usize()));
    assert!(
        pde.is_present(),
        "page walk failed: directory slot {} not present for {virt}",
        dir_index(virt.as_usize()),
    );

    // SAFETY: a present directory entry names a live table frame.
    let table = unsafe { TableRef::from_frame(pde.frame()) };
    let pte = table.entry(table_index(virt.as_usize()));
    assert!(
        pte.is_present(),
        "page walk failed: page at {virt} not present",
    );

    let translator = AddressTranslator::current();
    let base: *mut u8 = translator.phys_to_ptr(pte.frame().start().as_usize());
    // SAFETY: the frame is PAGE_SIZE bytes and the offset is below PAGE_SIZE.
    unsafe { base.add(virt.page_offset()) }
}

/// The ways an emulated memory access can fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// No present mapping covers the address.
    NotPresent,
    /// The mapping exists but forbids writing.
    NotWritable,
}

/// Translates a virtual address of the active address space for an ordinary
/// load or store, honoring the present and writable bits.
///
/// This is the emulated MMU's data path, used by [`crate::access`] to model
/// what user or kernel code would observe; protection violations surface as
/// [`AccessFault`] instead of panicking.
pub fn translate_checked(
    root: FrameNumber,
    virt: VirtualAddress,
    write: bool,
) -> Result<*mut u8, AccessFault> {
    // SAFETY: `root` names a live directory frame of the active space.
    let dir = unsafe { TableRef::from_frame(root) };
    let pde = dir.entry(dir_index(virt.as_usize()));
    if !pde.is_present() {
        return Err(AccessFault::NotPresent);
    }

    // SAFETY: a present directory entry names a live table frame.
    let table = unsafe { TableRef::from_frame(pde.frame()) };
    let pte = table.entry(table_index(virt.as_usize()));
    if !pte.is_present() {
        return Err(AccessFault::NotPresent);
    }
    if write && !pte.flags().is_writable() {
        return Err(AccessFault::NotWritable);
    }

    let translator = AddressTranslator::current();
    let base: *mut u8 = translator.phys_to_ptr(pte.frame().start().as_usize());
    // SAFETY: the frame is PAGE_SIZE bytes and the offset is below PAGE_SIZE.
    Ok(unsafe { base.add(virt.page_offset()) })
}

/// Emulated physical memory.
///
/// Provides a simulated physical memory space for testing paging operations
/// without actual hardware or virtual memory support from the host OS.
pub struct EmulatedMemory {
    /// The underlying memory buffer.
    memory: Vec<u8>,
    /// Next allocation offset (simple bump allocator).
    next_alloc: core::sync::atomic::AtomicUsize,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        assert!(
            validate_physical(size - 1),
            "emulated memory exceeds the physical address width"
        );
        Self {
            memory: alloc::vec![0u8; size],
            next_alloc: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Allocates a block of memory from the emulated space.
    ///
    /// Returns the physical address of the allocated block, or None if
    /// there's not enough space.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        use core::sync::atomic::Ordering;

        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);

            // Align the current offset
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;

            if end > self.memory.len() {
                return None;
            }

            // Try to claim this allocation
            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.memory.len(), "physical address out of bounds");
        unsafe { self.memory.as_ptr().add(phys) as *mut u8 }
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr()) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.memory.len(),
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction() {
        // dir 2, table 1, offset 4
        let addr = (2 << DIR_INDEX_SHIFT) | (1 << TABLE_INDEX_SHIFT) | 4;
        assert_eq!(dir_index(addr), 2);
        assert_eq!(table_index(addr), 1);
    }

    #[test]
    fn index_extraction_on_canonical_upper_half() {
        let addr = canonicalize_virtual(SELF_MAP_SLOT << DIR_INDEX_SHIFT);
        assert_eq!(dir_index(addr), SELF_MAP_SLOT);
        assert_eq!(table_index(addr), 0);
    }

    #[test]
    fn canonicalization() {
        assert_eq!(canonicalize_virtual(0x0100), 0x0100);
        let upper = canonicalize_virtual(1 << (MAX_VIRTUAL_BITS - 1));
        assert!(validate_virtual(upper));
        assert!(!validate_virtual(1 << (MAX_VIRTUAL_BITS - 1)));
    }

    #[test]
    fn kernel_slots_are_upper_half() {
        assert!(slot_base(KERNEL_SPACE_SLOT).is_kernel());
        assert!(!slot_base(KERNEL_SPACE_SLOT - 1).is_kernel());
    }

    #[test]
    fn emulated_memory_allocate_and_translate() {
        let mem = EmulatedMemory::new(1024);
        assert_eq!(mem.size(), 1024);
        let a = mem.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = mem.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a % PAGE_SIZE, 0);
        assert_ne!(a, b);

        let p = mem.translate(a);
        assert_eq!(mem.ptr_to_phys(p), a);
    }

    #[test]
    fn emulated_memory_exhaustion() {
        let mem = EmulatedMemory::new(2 * PAGE_SIZE);
        assert!(mem.allocate(PAGE_SIZE, PAGE_SIZE).is_some());
        assert!(mem.allocate(PAGE_SIZE, PAGE_SIZE).is_some());
        assert!(mem.allocate(PAGE_SIZE, PAGE_SIZE).is_none());
    }
}
