//! Views into an address space's page tables.
//!
//! The recursive self-mapping makes every page table of the *active* address
//! space addressable as ordinary memory through a fixed window; the foreign
//! window does the same for one *other* address space at a time by installing
//! that space's directory frame into a reserved directory slot. This module
//! wraps both behind [`AddressSpaceView`] so the mapping engine and the
//! copy-on-write resolver never touch raw window addresses.
//!
//! All of this runs under the global paging lock.

use crate::{
    FrameNumber, VirtualAddress,
    arch::{self, PageEntry, PageFlags},
    cpu,
    page_dir::PageDir,
};

/// Window arithmetic: the address of the page-table entry mapping `virt`,
/// as exposed through the window rooted at `base`.
///
/// The window lays the target's page tables out one per page, ordered by
/// directory slot, so the entry lives at
/// `base + dir_index * PAGE_SIZE + table_index * ENTRY_SIZE`.
#[inline]
pub(crate) fn table_entry_addr(base: VirtualAddress, virt: VirtualAddress) -> VirtualAddress {
    base + virt.dir_index() * arch::PAGE_SIZE + virt.table_index() * arch::ENTRY_SIZE
}

/// Window arithmetic: the address of the directory entry for `slot`.
///
/// Every directory's self-map slot points at the directory itself, so the
/// directory appears within its own window as the page for
/// `SELF_MAP_SLOT` — in a foreign window just as in the self-map.
#[inline]
pub(crate) fn dir_entry_addr(base: VirtualAddress, slot: usize) -> VirtualAddress {
    base + arch::SELF_MAP_SLOT * arch::PAGE_SIZE + slot * arch::ENTRY_SIZE
}

/// Resolves a window address to an entry pointer through the active root.
fn entry_ptr(addr: VirtualAddress) -> *mut PageEntry {
    let root = cpu::active_dir().expect("no active address space");
    arch::window_ptr(root, addr) as *mut PageEntry
}

/// A window onto one address space's page tables.
///
/// `Active` is zero-cost: it is the hardware's own recursive mapping.
/// `Foreign` is backed by the foreign-map window and only valid until the
/// next window install; it is created fresh (and revalidated) by every
/// public operation, so holding one across operations is impossible by
/// construction.
#[derive(Clone, Copy)]
pub(crate) enum AddressSpaceView {
    /// The active address space, through the self-map.
    Active { base: VirtualAddress },
    /// Another address space, through the foreign-map window.
    Foreign { base: VirtualAddress },
}

impl AddressSpaceView {
    /// Returns the window base address.
    pub(crate) fn base(self) -> VirtualAddress {
        match self {
            Self::Active { base } | Self::Foreign { base } => base,
        }
    }

    /// Returns true if this view is the active space's self-map.
    pub(crate) fn is_active(self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Reads the directory entry for the given slot.
    pub(crate) fn pde(self, slot: usize) -> PageEntry {
        // SAFETY: the window resolves to the target's directory frame.
        unsafe { *entry_ptr(dir_entry_addr(self.base(), slot)) }
    }

    /// Writes the directory entry for the given slot.
    pub(crate) fn set_pde(self, slot: usize, entry: PageEntry) {
        // SAFETY: the window resolves to the target's directory frame.
        unsafe { *entry_ptr(dir_entry_addr(self.base(), slot)) = entry };
    }

    /// Reads the page-table entry mapping `virt`.
    ///
    /// The covering page table must exist (its directory entry must be
    /// present); the window cannot resolve entries of absent tables.
    pub(crate) fn pte(self, virt: VirtualAddress) -> PageEntry {
        // SAFETY: the window resolves to the covering table frame.
        unsafe { *entry_ptr(table_entry_addr(self.base(), virt)) }
    }

    /// Writes the page-table entry mapping `virt`.
    pub(crate) fn set_pte(self, virt: VirtualAddress, entry: PageEntry) {
        // SAFETY: the window resolves to the covering table frame.
        unsafe { *entry_ptr(table_entry_addr(self.base(), virt)) = entry };
    }

    /// Returns the window address of the page exposing the table for `slot`,
    /// for zeroing a fresh table or invalidating its window translation.
    pub(crate) fn table_page(self, slot: usize) -> VirtualAddress {
        self.base() + slot * arch::PAGE_SIZE
    }

    /// Returns a [`arch::TableRef`] over the table for `slot`, which must be
    /// present.
    pub(crate) fn table_ref(self, slot: usize) -> arch::TableRef {
        let page = self.table_page(slot);
        let root = cpu::active_dir().expect("no active address space");
        // SAFETY: the window resolves the table's page to its frame.
        unsafe { arch::TableRef::from_ptr(arch::window_ptr(root, page)) }
    }
}

/// Returns the self-map view of the active address space.
pub(crate) fn active_view() -> AddressSpaceView {
    AddressSpaceView::Active {
        base: arch::slot_base(arch::SELF_MAP_SLOT),
    }
}

/// Opens a view onto `target`'s page tables.
///
/// If `target` is the active space this is the self-map and costs nothing.
/// Otherwise the foreign window is used: if the window already exposes
/// `target` and this CPU flushed it no earlier than `target`'s last
/// directory change, the cached window is reused without TLB work; otherwise
/// the target's directory frame is installed into the foreign slot, the
/// window range is flushed, and the staleness clock is recorded.
pub(crate) fn open(target: &PageDir) -> AddressSpaceView {
    let active = cpu::active_dir().expect("no active address space");
    if target.phys() == active {
        return active_view();
    }

    let cpu_state = cpu::current();
    let clock = target.last_change();

    // The foreign-slot directory entry is the ground truth for what the
    // window exposes; the per-CPU clock only decides whether it was flushed
    // recently enough on this CPU.
    let pde = active_view().pde(arch::FOREIGN_MAP_SLOT);
    let installed = pde.is_present() && pde.frame() == target.phys();

    if !installed || !cpu_state.foreign_fresh(target.phys(), clock) {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(true);
        flags.set_supervisor(true);
        active_view().set_pde(arch::FOREIGN_MAP_SLOT, PageEntry::new(target.phys(), flags));
        arch::invalidate_range(arch::slot_base(arch::FOREIGN_MAP_SLOT), arch::ENTRY_COUNT);
        cpu_state.record_foreign(target.phys(), clock);
    }

    AddressSpaceView::Foreign {
        base: arch::slot_base(arch::FOREIGN_MAP_SLOT),
    }
}

/// Drops the foreign window if it currently exposes `target`.
///
/// Used during teardown so the foreign slot never names a freed directory
/// frame.
pub(crate) fn close_foreign(target: &PageDir) {
    if cpu::active_dir().is_none() {
        return;
    }
    let pde = active_view().pde(arch::FOREIGN_MAP_SLOT);
    if pde.is_present() && pde.frame() == target.phys() {
        active_view().set_pde(arch::FOREIGN_MAP_SLOT, PageEntry::empty());
        arch::invalidate_range(arch::slot_base(arch::FOREIGN_MAP_SLOT), arch::ENTRY_COUNT);
    }
}

/// Maps `frame` into this CPU's temp-map slot for the duration of the
/// closure.
///
/// The temp slot is how kernel code reaches a frame that is not mapped
/// anywhere else (a fresh directory, a copy-on-write duplicate). Each CPU
/// has its own slot in the temp-map area; the slot's mutex guards against
/// reentrant use on the same CPU.
pub(crate) fn with_temp<R>(frame: FrameNumber, f: impl FnOnce(*mut u8) -> R) -> R {
    let cpu_state = cpu::current();
    let _busy = cpu_state.temp_busy.lock();

    let root = cpu::active_dir().expect("no active address space");
    let slot_virt = arch::slot_base(arch::TEMP_MAP_SLOT) + cpu::id() * arch::PAGE_SIZE;

    let mut flags = PageFlags::empty();
    flags.set_present(true);
    flags.set_writable(true);
    flags.set_supervisor(true);
    active_view().set_pte(slot_virt, PageEntry::new(frame, flags));
    arch::invalidate_page(slot_virt);

    let result = f(arch::window_ptr(root, slot_virt));

    active_view().set_pte(slot_virt, PageEntry::empty());
    arch::invalidate_page(slot_virt);

    result
}

/// Zeroes a frame through the temp-map slot.
pub(crate) fn zero_frame(frame: FrameNumber) {
    with_temp(frame, |ptr| {
        // SAFETY: the temp slot maps exactly PAGE_SIZE writable bytes.
        unsafe { core::ptr::write_bytes(ptr, 0, arch::PAGE_SIZE) };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn self_view_exposes_the_directory() {
        let machine = testing::boot();
        let view = open(&machine.root);

        assert!(view.is_active());
        let self_pde = view.pde(arch::SELF_MAP_SLOT);
        assert!(self_pde.is_present());
        assert_eq!(self_pde.frame(), machine.root.phys());
    }

    #[test]
    fn foreign_window_exposes_other_directory() {
        let machine = testing::boot();
        let child = PageDir::clone_kernel_space(&machine.root).unwrap();

        let view = open(&child);
        assert!(!view.is_active());
        assert_eq!(view.pde(arch::SELF_MAP_SLOT).frame(), child.phys());
    }

    #[test]
    fn foreign_window_reuse_skips_tlb_flush() {
        let machine = testing::boot();
        let child = PageDir::clone_kernel_space(&machine.root).unwrap();

        let first = open(&child);
        let flushes = arch::tlb_flush_count();
        let second = open(&child);

        assert_eq!(first.base(), second.base());
        assert_eq!(arch::tlb_flush_count(), flushes);
    }

    #[test]
    fn directory_change_in_target_reflushes_window() {
        use crate::{FrameInput, MapFlags, VirtualAddress};

        let machine = testing::boot();
        let child = PageDir::clone_kernel_space(&machine.root).unwrap();

        open(&child);
        // Creating a page table in the child changes its directory.
        child
            .map(
                VirtualAddress::new(0),
                FrameInput::Allocate,
                1,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();

        let flushes = arch::tlb_flush_count();
        open(&child);
        assert!(arch::tlb_flush_count() > flushes);
    }

    #[test]
    fn temp_mapping_reaches_an_unmapped_frame() {
        let machine = testing::boot();
        let frame = machine.alloc.take_frame();

        with_temp(frame, |ptr| unsafe {
            core::ptr::write_bytes(ptr, 0xA5, arch::PAGE_SIZE);
        });
        with_temp(frame, |ptr| unsafe {
            assert_eq!(*ptr, 0xA5);
            assert_eq!(*ptr.add(arch::PAGE_SIZE - 1), 0xA5);
        });

        // The slot is torn down after use.
        let slot_virt = arch::slot_base(arch::TEMP_MAP_SLOT);
        assert!(!active_view().pte(slot_virt).exists());
    }
}
