//! The mapping engine: the sole path by which any virtual page becomes
//! present or absent.
//!
//! `map` and `unmap` operate through an [`AddressSpaceView`], so the same
//! code manipulates the active address space (via the self-map) and foreign
//! ones (via the foreign window). Partial failures are unwound by a
//! [`Rollback`] guard that restores saved entries and frees freshly
//! allocated frames automatically when the operation returns early.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::{
    FrameNumber, PhysicalAddress, VirtualAddress,
    arch::{self, PageEntry, PageFlags},
    cow,
    frames::{self, FrameClass},
    page_dir::PageDir,
    shootdown, sync,
    view::{self, AddressSpaceView},
};

bitflags! {
    /// Flags controlling how [`PageDir::map`] writes page-table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Map the pages as present.
        const PRESENT = 1 << 0;
        /// Allow writes (only effective together with `PRESENT`).
        const WRITABLE = 1 << 1;
        /// Restrict access to kernel mode.
        const SUPERVISOR = 1 << 2;
        /// Keep the translation across address-space switches.
        const GLOBAL = 1 << 3;
        /// Mark the pages shared copy-on-write (implies read-only).
        const COPY_ON_WRITE = 1 << 4;
        /// The frames are not owned by the entries and must never be freed.
        const NO_FREE = 1 << 5;
    }
}

/// Where [`PageDir::map`] takes each page's frame from.
#[derive(Clone, Copy)]
pub enum FrameInput<'a> {
    /// Allocate a fresh frame per present page from the external allocator.
    Allocate,
    /// Use the given frames, one per page.
    Frames(&'a [FrameNumber]),
    /// Use the frames containing the given physical addresses, one per page.
    Addresses(&'a [PhysicalAddress]),
    /// Keep each entry's current frame; only the protection bits change.
    Keep,
}

/// Errors a mapping operation can return.
///
/// Out-of-memory is the only recoverable paging error; it is always
/// accompanied by full rollback of the failing call. Everything else that
/// can go wrong in the paging core is an invariant violation and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A frame or page-table allocation failed.
    OutOfMemory,
}

/// One recorded undo step.
pub(crate) enum Undo<'a> {
    /// Restore a page-table entry to its prior value, freeing the frame this
    /// call allocated for it.
    RestoreEntry {
        space: &'a PageDir,
        view: AddressSpaceView,
        virt: VirtualAddress,
        old: PageEntry,
        fresh_frame: Option<(FrameNumber, FrameClass)>,
    },
    /// Remove a page table this call created.
    RemoveTable {
        space: &'a PageDir,
        view: AddressSpaceView,
        slot: usize,
        frame: FrameNumber,
    },
    /// Remove a ledger entry this call registered.
    Deregister {
        frame: FrameNumber,
        owner: FrameNumber,
    },
}

/// RAII rollback list.
///
/// Records undo steps as an operation progresses and replays them in reverse
/// when dropped, unless the operation completed and disarmed it. Runs under
/// the global paging lock like the operation itself.
pub(crate) struct Rollback<'a> {
    actions: Vec<Undo<'a>>,
    armed: bool,
}

impl<'a> Rollback<'a> {
    pub(crate) fn new() -> Self {
        Self {
            actions: Vec::new(),
            armed: true,
        }
    }

    pub(crate) fn push(&mut self, undo: Undo<'a>) {
        self.actions.push(undo);
    }

    /// The operation succeeded; nothing will be undone.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
        self.actions.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        while let Some(undo) = self.actions.pop() {
            match undo {
                Undo::RestoreEntry {
                    space,
                    view,
                    virt,
                    old,
                    fresh_frame,
                } => {
                    view.set_pte(virt, old);
                    if view.is_active() {
                        arch::invalidate_page(virt);
                    } else {
                        shootdown::notify(space.phys(), virt, 1);
                    }
                    if let Some((frame, class)) = fresh_frame {
                        frames::free(frame, class);
                    }
                }
                Undo::RemoveTable {
                    space,
                    view,
                    slot,
                    frame,
                } => {
                    view.set_pde(slot, PageEntry::empty());
                    space.bump_change();
                    arch::invalidate_page(view.table_page(slot));
                    frames::free(frame, FrameClass::Critical);
                }
                Undo::Deregister { frame, owner } => {
                    cow::remove_entry(frame, owner);
                }
            }
        }
    }
}

/// Validates a page range: aligned, canonical, within one side of the
/// user/kernel split, and clear of the reserved window slots.
///
/// Violations are caller bugs and fatal.
pub(crate) fn check_range(virt: VirtualAddress, count: usize) {
    assert!(
        virt.is_aligned(arch::PAGE_SIZE),
        "virtual address must be page-aligned"
    );
    if count == 0 {
        return;
    }
    let last = virt + (count - 1) * arch::PAGE_SIZE;
    assert!(
        virt.is_kernel() == last.is_kernel(),
        "page range crosses the user/kernel split"
    );
    for slot in virt.dir_index()..=last.dir_index() {
        assert!(
            !arch::is_reserved_slot(slot),
            "page range covers reserved directory slot {slot}"
        );
    }
}

/// Ensures the page table covering `virt` exists in the viewed space,
/// allocating and zeroing one if needed. Returns true if a table was
/// created.
pub(crate) fn ensure_table<'a>(
    space: &'a PageDir,
    view: AddressSpaceView,
    virt: VirtualAddress,
    user_accessible: bool,
    rollback: &mut Rollback<'a>,
) -> Result<bool, MapError> {
    let slot = virt.dir_index();
    if view.pde(slot).is_present() {
        return Ok(false);
    }
    // Shared kernel tables are allocated at boot and permanent; a missing one
    // here means the directory is corrupt.
    assert!(
        !arch::is_kernel_slot(slot),
        "kernel page table missing for directory slot {slot}"
    );

    let frame = frames::allocate(FrameClass::Critical).ok_or(MapError::OutOfMemory)?;
    let mut flags = PageFlags::empty();
    flags.set_present(true);
    flags.set_writable(true);
    flags.set_supervisor(!user_accessible);
    view.set_pde(slot, PageEntry::new(frame, flags));
    space.bump_change();
    // The new table is visible through the window now; flush the window
    // translation before zeroing the (still uninitialized) frame through it.
    arch::invalidate_page(view.table_page(slot));
    view.table_ref(slot).zero();

    rollback.push(Undo::RemoveTable {
        space,
        view,
        slot,
        frame,
    });
    Ok(true)
}

impl PageDir {
    /// Maps `count` consecutive pages starting at `virt`.
    ///
    /// Missing page tables are allocated and linked on the way. Each entry is
    /// made present iff `flags` contains `PRESENT` and writable iff it also
    /// contains `WRITABLE`; the frame comes from `frames` (see
    /// [`FrameInput`]). Pages are processed in increasing virtual order, and
    /// the TLB entry for each page is invalidated when this address space is
    /// the active one.
    ///
    /// Returns the number of page tables created.
    ///
    /// On `Err(OutOfMemory)` everything this call changed has been rolled
    /// back: mapped pages are unmapped, fresh frames returned, created
    /// tables removed.
    pub fn map(
        &self,
        virt: VirtualAddress,
        frames: FrameInput<'_>,
        count: usize,
        flags: MapFlags,
    ) -> Result<usize, MapError> {
        let _guard = sync::lock();
        self.map_locked(virt, frames, count, flags)
    }

    pub(crate) fn map_locked(
        &self,
        virt: VirtualAddress,
        frames: FrameInput<'_>,
        count: usize,
        flags: MapFlags,
    ) -> Result<usize, MapError> {
        check_range(virt, count);
        match &frames {
            FrameInput::Frames(s) => assert!(s.len() >= count, "frame list shorter than count"),
            FrameInput::Addresses(s) => {
                assert!(s.len() >= count, "address list shorter than count")
            }
            FrameInput::Allocate | FrameInput::Keep => {}
        }
        if count == 0 {
            return Ok(0);
        }

        let view = view::open(self);
        let active = view.is_active();
        let mut rollback = Rollback::new();
        let mut tables_created = 0;

        let first_page = virt.page_number();
        for (i, page) in (first_page..first_page + count).enumerate() {
            let v = page.start();
            if ensure_table(
                self,
                view,
                v,
                !flags.contains(MapFlags::SUPERVISOR),
                &mut rollback,
            )? {
                tables_created += 1;
            }

            let old = view.pte(v);
            let (frame, fresh_frame) = match frames {
                FrameInput::Keep => (old.frame(), None),
                FrameInput::Frames(s) => (s[i], None),
                FrameInput::Addresses(s) => (s[i].frame_number(), None),
                FrameInput::Allocate => {
                    if flags.contains(MapFlags::PRESENT) {
                        let class = if flags.contains(MapFlags::SUPERVISOR) {
                            FrameClass::Kernel
                        } else {
                            FrameClass::User
                        };
                        let frame = frames::allocate(class).ok_or(MapError::OutOfMemory)?;
                        (frame, Some((frame, class)))
                    } else {
                        (FrameNumber::new(0), None)
                    }
                }
            };

            let mut entry_flags = PageFlags::empty();
            entry_flags.set_present(flags.contains(MapFlags::PRESENT));
            entry_flags
                .set_writable(flags.contains(MapFlags::PRESENT | MapFlags::WRITABLE));
            entry_flags.set_supervisor(flags.contains(MapFlags::SUPERVISOR));
            entry_flags.set_global(flags.contains(MapFlags::GLOBAL));
            entry_flags.set_copy_on_write(flags.contains(MapFlags::COPY_ON_WRITE));
            entry_flags.set_no_free(flags.contains(MapFlags::NO_FREE));
            view.set_pte(v, PageEntry::new(frame, entry_flags));

            rollback.push(Undo::RestoreEntry {
                space: self,
                view,
                virt: v,
                old,
                fresh_frame,
            });
            if active {
                arch::invalidate_page(v);
            }
        }

        rollback.disarm();
        if !active {
            shootdown::notify(self.phys(), virt, count);
        }
        Ok(tables_created)
    }

    /// Unmaps `count` consecutive pages starting at `virt`.
    ///
    /// Present entries are cleared; when `free_frames` is set, owned frames
    /// go back to the allocator and copy-on-write frames are deregistered
    /// from the ownership ledger (freed only if this space was the last
    /// owner). A user-space page table whose last entry disappears is
    /// reclaimed eagerly; kernel tables are permanent.
    ///
    /// Returns the number of page tables freed.
    pub fn unmap(&self, virt: VirtualAddress, count: usize, free_frames: bool) -> usize {
        let _guard = sync::lock();
        self.unmap_locked(virt, count, free_frames)
    }

    pub(crate) fn unmap_locked(
        &self,
        virt: VirtualAddress,
        count: usize,
        free_frames: bool,
    ) -> usize {
        check_range(virt, count);
        if count == 0 {
            return 0;
        }

        let view = view::open(self);
        let active = view.is_active();
        let mut tables_freed = 0;

        let first_page = virt.page_number();
        for page in first_page..first_page + count {
            let v = page.start();
            let slot = v.dir_index();
            let pde = view.pde(slot);
            if !pde.is_present() {
                continue;
            }

            let entry = view.pte(v);
            if !entry.exists() {
                continue;
            }

            if entry.is_present() && free_frames {
                let flags = entry.flags();
                if flags.is_copy_on_write() {
                    cow::deregister(entry.frame(), self.phys());
                } else if !flags.is_no_free() {
                    let class = if flags.is_supervisor() {
                        FrameClass::Kernel
                    } else {
                        FrameClass::User
                    };
                    frames::free(entry.frame(), class);
                }
            }
            view.set_pte(v, PageEntry::empty());
            if active {
                arch::invalidate_page(v);
            }

            if !arch::is_kernel_slot(slot) && view.table_ref(slot).is_empty() {
                view.set_pde(slot, PageEntry::empty());
                self.bump_change();
                arch::invalidate_page(view.table_page(slot));
                frames::free(pde.frame(), FrameClass::Critical);
                tables_freed += 1;
            }
        }

        if !active {
            shootdown::notify(self.phys(), virt, count);
        }
        tables_freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    const V: VirtualAddress = VirtualAddress::new(0x0100);

    #[test]
    fn map_then_unmap_round_trip() {
        let machine = testing::boot();
        let frame = machine.alloc.take_frame();

        let tables = machine
            .root
            .map(
                V,
                FrameInput::Frames(&[frame]),
                1,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();
        assert_eq!(tables, 1);
        assert!(machine.root.is_present(V));
        assert_eq!(machine.root.frame_of(V), Some(frame));

        let freed = machine.root.unmap(V, 1, false);
        assert_eq!(freed, 1);
        assert!(!machine.root.is_present(V));
    }

    #[test]
    fn map_by_physical_address() {
        let machine = testing::boot();
        let frame = machine.alloc.take_frame();

        machine
            .root
            .map(
                V,
                FrameInput::Addresses(&[frame.start()]),
                1,
                MapFlags::PRESENT,
            )
            .unwrap();
        assert_eq!(machine.root.frame_of(V), Some(frame));
    }

    #[test]
    fn keep_frame_flips_protection_only() {
        let machine = testing::boot();
        let frame = machine.alloc.take_frame();

        machine
            .root
            .map(
                V,
                FrameInput::Frames(&[frame]),
                1,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();
        assert!(machine.root.entry_flags(V).unwrap().is_writable());

        machine
            .root
            .map(V, FrameInput::Keep, 1, MapFlags::PRESENT)
            .unwrap();
        let flags = machine.root.entry_flags(V).unwrap();
        assert!(!flags.is_writable());
        assert_eq!(machine.root.frame_of(V), Some(frame));
    }

    #[test]
    fn unmap_with_free_restores_the_free_frame_count() {
        let machine = testing::boot();
        let before = machine.alloc.free_count();

        machine
            .root
            .map(
                V,
                FrameInput::Allocate,
                2,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();
        assert!(machine.alloc.free_count() < before);

        machine.root.unmap(V, 2, true);
        assert_eq!(machine.alloc.free_count(), before);
    }

    #[test]
    fn empty_table_is_reclaimed_nonempty_is_not() {
        let machine = testing::boot();

        // Two pages under the same page table.
        machine
            .root
            .map(
                V,
                FrameInput::Allocate,
                2,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();

        assert_eq!(machine.root.unmap(V, 1, true), 0);
        assert!(machine.root.is_present(V + arch::PAGE_SIZE));

        assert_eq!(machine.root.unmap(V + arch::PAGE_SIZE, 1, true), 1);
        assert!(!machine.root.is_present(V + arch::PAGE_SIZE));
    }

    #[test]
    fn failed_map_rolls_back_completely() {
        let machine = testing::boot();

        // Leave too few frames for the whole request (4 pages + 1 table).
        machine.alloc.drain_to(3);
        let before = machine.alloc.free_count();

        let result = machine.root.map(
            V,
            FrameInput::Allocate,
            4,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        );
        assert_eq!(result, Err(MapError::OutOfMemory));

        assert_eq!(machine.alloc.free_count(), before);
        for page in 0..4 {
            assert!(!machine.root.is_present(V + page * arch::PAGE_SIZE));
        }
    }

    #[test]
    fn mapping_into_a_foreign_space_works() {
        let machine = testing::boot();
        let child = crate::PageDir::clone_kernel_space(&machine.root).unwrap();
        let frame = machine.alloc.take_frame();

        child
            .map(
                V,
                FrameInput::Frames(&[frame]),
                1,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();

        assert_eq!(child.frame_of(V), Some(frame));
        assert!(!machine.root.is_present(V));
    }

    #[test]
    #[should_panic(expected = "reserved directory slot")]
    fn mapping_a_reserved_slot_is_fatal() {
        let machine = testing::boot();
        machine
            .root
            .map(
                arch::slot_base(arch::FOREIGN_MAP_SLOT),
                FrameInput::Allocate,
                1,
                MapFlags::PRESENT | MapFlags::SUPERVISOR,
            )
            .ok();
    }

    #[test]
    #[should_panic(expected = "page-aligned")]
    fn unaligned_map_is_fatal() {
        let machine = testing::boot();
        machine
            .root
            .map(V + 1, FrameInput::Allocate, 1, MapFlags::PRESENT)
            .ok();
    }
}
