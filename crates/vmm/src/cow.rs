//! Copy-on-write: the frame-ownership ledger and the page-fault resolver.
//!
//! Every frame shared copy-on-write has one ledger entry per sharing address
//! space. Entries are created when pages are cloned without sharing, removed
//! when an owner resolves a write fault on the frame or disappears, and the
//! frame itself goes back to the allocator only when its last entry does.
//!
//! The ledger is a flat list scanned linearly per fault. That is plenty for
//! the sharing fan-outs this kernel sees; a production kernel would index by
//! frame number.

use alloc::vec::Vec;

use crate::{
    FrameNumber, VirtualAddress,
    arch::{self, PageEntry},
    cpu,
    frames::{self, FrameClass},
    page_dir::PageDir,
    sync, view,
};

/// One sharing record: `frame` is held copy-on-write by the address space
/// rooted at `owner`.
struct LedgerEntry {
    frame: FrameNumber,
    owner: FrameNumber,
}

/// The frame-ownership ledger.
pub(crate) struct CowLedger {
    entries: Vec<LedgerEntry>,
}

impl CowLedger {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Records that `owner` shares `frame`.
    fn register(&mut self, frame: FrameNumber, owner: FrameNumber) {
        self.entries.push(LedgerEntry { frame, owner });
    }

    /// Removes one entry for (`frame`, `owner`). Returns false if there was
    /// none.
    fn remove(&mut self, frame: FrameNumber, owner: FrameNumber) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.frame == frame && e.owner == owner)
        {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns true if (`frame`, `owner`) is recorded.
    fn has_owner(&self, frame: FrameNumber, owner: FrameNumber) -> bool {
        self.entries
            .iter()
            .any(|e| e.frame == frame && e.owner == owner)
    }

    /// Returns true if any address space other than `owner` shares `frame`.
    fn shared_with_others(&self, frame: FrameNumber, owner: FrameNumber) -> bool {
        self.entries
            .iter()
            .any(|e| e.frame == frame && e.owner != owner)
    }

    /// Returns true if any entry for `frame` remains.
    fn is_shared(&self, frame: FrameNumber) -> bool {
        self.entries.iter().any(|e| e.frame == frame)
    }

    /// Removes every entry owned by `owner`, returning the removed frames.
    fn remove_owner(&mut self, owner: FrameNumber) -> Vec<FrameNumber> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if e.owner == owner {
                removed.push(e.frame);
                false
            } else {
                true
            }
        });
        removed
    }
}

/// The global ledger.
///
/// Its mutex nests strictly inside the global paging lock and is never held
/// across calls into other paging code. In test/software-emulation mode it is
/// thread-local, one ledger per emulated machine.
#[cfg(not(any(test, feature = "software-emulation")))]
static LEDGER: spin::Mutex<CowLedger> = spin::Mutex::new(CowLedger::new());

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static LEDGER: spin::Mutex<CowLedger> = const { spin::Mutex::new(CowLedger::new()) };
}

fn with_ledger<R>(f: impl FnOnce(&mut CowLedger) -> R) -> R {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        f(&mut LEDGER.lock())
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        LEDGER.with(|l| f(&mut l.lock()))
    }
}

/// Records that `owner` shares `frame` copy-on-write.
pub(crate) fn register(frame: FrameNumber, owner: FrameNumber) {
    with_ledger(|ledger| ledger.register(frame, owner));
}

/// Returns true if (`frame`, `owner`) is recorded.
pub(crate) fn has_owner(frame: FrameNumber, owner: FrameNumber) -> bool {
    with_ledger(|ledger| ledger.has_owner(frame, owner))
}

/// Removes one (`frame`, `owner`) entry without freeing anything. Rollback
/// paths use this to take back registrations they made.
pub(crate) fn remove_entry(frame: FrameNumber, owner: FrameNumber) {
    with_ledger(|ledger| ledger.remove(frame, owner));
}

/// Removes `owner`'s entry for `frame` because its mapping goes away,
/// freeing the frame if it was the last owner.
///
/// # Panics
///
/// A `copy_on_write` page-table entry without a matching ledger entry means
/// the ledger and the page tables disagree, which is unrecoverable.
pub(crate) fn deregister(frame: FrameNumber, owner: FrameNumber) {
    let last = with_ledger(|ledger| {
        let removed = ledger.remove(frame, owner);
        assert!(
            removed,
            "copy-on-write frame {frame} has no ledger entry for its owner"
        );
        !ledger.is_shared(frame)
    });
    if last {
        frames::free(frame, FrameClass::User);
    }
}

/// Removes every entry owned by the dying address space rooted at `owner`,
/// freeing frames that lost their last owner. Returns the number of entries
/// removed (zero when the region manager cleaned up properly).
pub(crate) fn drop_space(owner: FrameNumber) -> usize {
    let (count, orphaned) = with_ledger(|ledger| {
        let removed = ledger.remove_owner(owner);
        let orphaned: Vec<FrameNumber> = removed
            .iter()
            .copied()
            .filter(|&frame| !ledger.is_shared(frame))
            .collect();
        (removed.len(), orphaned)
    });
    for frame in orphaned {
        frames::free(frame, FrameClass::User);
    }
    count
}

impl PageDir {
    /// Attempts to resolve the fault at `virt` as a copy-on-write fault.
    ///
    /// Returns false when the fault is not ours to handle: no covering table,
    /// page not present, or not marked copy-on-write. The trap handler then
    /// treats it as a genuine illegal access.
    ///
    /// When the faulting frame is still shared with another address space it
    /// is duplicated through this CPU's temp-map slot; when this space was
    /// the last sharer the frame is kept and only re-enabled for writing. In
    /// both cases this space's ledger entry disappears and the TLB entry for
    /// the page is invalidated.
    ///
    /// Allocation failure during duplication is reported as "not handled"
    /// without touching any paging state; the caller decides the process's
    /// fate.
    pub fn handle_page_fault(&self, virt: VirtualAddress) -> bool {
        let _guard = sync::lock();
        assert_eq!(
            cpu::active_dir(),
            Some(self.phys()),
            "page faults resolve through the active address space"
        );

        let page = virt.align_down(arch::PAGE_SIZE);
        let active = view::active_view();
        if !active.pde(page.dir_index()).is_present() {
            return false;
        }
        let entry = active.pte(page);
        if !entry.is_present() || !entry.flags().is_copy_on_write() {
            return false;
        }

        let frame = entry.frame();
        let (ours, shared) = with_ledger(|ledger| {
            (
                ledger.has_owner(frame, self.phys()),
                ledger.shared_with_others(frame, self.phys()),
            )
        });
        if !ours {
            panic!(
                "copy-on-write frame {frame} mapped at {page} has no ledger entry \
                 for this address space"
            );
        }

        let mut flags = entry.flags();
        flags.set_copy_on_write(false);
        flags.set_writable(true);

        if shared {
            // Allocate before mutating anything so failure leaves the fault
            // exactly as we found it.
            let Some(new_frame) = frames::allocate(FrameClass::User) else {
                log::error!("out of memory duplicating copy-on-write page at {page}");
                return false;
            };
            with_ledger(|ledger| ledger.remove(frame, self.phys()));

            let root = cpu::active_dir().expect("no active address space");
            let src = arch::window_ptr(root, page) as *const u8;
            view::with_temp(new_frame, |dst| {
                // SAFETY: both sides are full, distinct frames.
                unsafe { core::ptr::copy_nonoverlapping(src, dst, arch::PAGE_SIZE) };
            });
            active.set_pte(page, PageEntry::new(new_frame, flags));
            log::trace!("copy-on-write: duplicated frame {frame} -> {new_frame} at {page}");
        } else {
            with_ledger(|ledger| ledger.remove(frame, self.phys()));
            active.set_pte(page, PageEntry::new(frame, flags));
            log::trace!("copy-on-write: frame {frame} at {page} kept exclusive");
        }

        arch::invalidate_page(page);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameInput, MapFlags, access, testing};

    const V: VirtualAddress = VirtualAddress::new(0x0200);

    #[test]
    fn unrelated_faults_are_not_ours() {
        let machine = testing::boot();

        // No covering table at all.
        assert!(!machine.root.handle_page_fault(V));

        // Present but plainly writable.
        machine
            .root
            .map(
                V,
                FrameInput::Allocate,
                1,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();
        assert!(!machine.root.handle_page_fault(V));
    }

    #[test]
    fn cloned_pages_share_until_write() {
        let machine = testing::boot();
        let root = &machine.root;

        root.map(
            V,
            FrameInput::Allocate,
            1,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        assert!(access::write(root, V, b"shared"));

        let child = PageDir::clone_kernel_space(root).unwrap();
        PageDir::clone_pages(root, &child, V, V, 1, false).unwrap();

        // Both sides are read-only copy-on-write over the same frame.
        for space in [root, &child] {
            let flags = space.entry_flags(V).unwrap();
            assert!(flags.is_copy_on_write());
            assert!(!flags.is_writable());
        }
        assert_eq!(root.frame_of(V), child.frame_of(V));

        unsafe { child.activate() };
        let mut buf = [0u8; 6];
        assert!(access::read(&child, V, &mut buf));
        assert_eq!(&buf, b"shared");

        // Writing in the child faults, duplicates, and leaves the parent's
        // bytes alone.
        assert!(access::write(&child, V, b"child!"));
        assert_ne!(root.frame_of(V), child.frame_of(V));
        assert!(child.entry_flags(V).unwrap().is_writable());

        unsafe { root.activate() };
        assert!(access::read(root, V, &mut buf));
        assert_eq!(&buf, b"shared");
        let flags = root.entry_flags(V).unwrap();
        assert!(flags.is_copy_on_write());
    }

    #[test]
    fn last_owner_keeps_the_frame_without_allocating() {
        let machine = testing::boot();
        let root = &machine.root;

        root.map(
            V,
            FrameInput::Allocate,
            1,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        let child = PageDir::clone_kernel_space(root).unwrap();
        PageDir::clone_pages(root, &child, V, V, 1, false).unwrap();
        let shared_frame = child.frame_of(V).unwrap();

        // The parent lets go before the child ever writes.
        root.unmap(V, 1, true);

        unsafe { child.activate() };
        let allocations = machine.alloc.allocation_count();
        assert!(access::write(&child, V, b"x"));

        assert_eq!(machine.alloc.allocation_count(), allocations);
        assert_eq!(child.frame_of(V), Some(shared_frame));
        assert!(child.entry_flags(V).unwrap().is_writable());
    }

    #[test]
    fn write_fault_with_exhausted_allocator_is_unhandled() {
        let machine = testing::boot();
        let root = &machine.root;

        root.map(
            V,
            FrameInput::Allocate,
            1,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        let child = PageDir::clone_kernel_space(root).unwrap();
        PageDir::clone_pages(root, &child, V, V, 1, false).unwrap();

        machine.alloc.drain_to(0);
        assert!(!root.handle_page_fault(V));

        // Nothing changed: still shared, still read-only.
        let flags = root.entry_flags(V).unwrap();
        assert!(flags.is_copy_on_write());
        assert!(has_owner(root.frame_of(V).unwrap(), root.phys()));
    }

    #[test]
    #[should_panic(expected = "no ledger entry")]
    fn cow_entry_without_ledger_record_is_fatal() {
        let machine = testing::boot();
        let frame = machine.alloc.take_frame();

        // A copy-on-write mapping forged without registering an owner.
        machine
            .root
            .map(
                V,
                FrameInput::Frames(&[frame]),
                1,
                MapFlags::PRESENT | MapFlags::COPY_ON_WRITE,
            )
            .unwrap();
        machine.root.handle_page_fault(V);
    }
}
