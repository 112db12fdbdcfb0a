//! Address-space handles and lifecycle.
//!
//! A [`PageDir`] is one process's address space: ownership of a page
//! directory frame plus the logical clock the foreign-window staleness check
//! relies on. The very first address space is built by hand in [`PageDir::init`];
//! every later one is cloned from a parent's kernel space for `fork`. Kernel
//! directory entries are identical across all address spaces (their page
//! tables are allocated once at boot and permanent), so cloning copies them
//! verbatim; the kernel-stack slot is the one private kernel slot.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    FrameNumber, VirtualAddress,
    address::AddressTranslator,
    arch::{self, PageEntry, PageFlags},
    cow, cpu,
    frames::{self, FrameClass},
    mapping::{self, MapError, Rollback, Undo},
    shootdown, sync, view,
};

/// Source of `last_change` values.
///
/// A single monotonic counter stamps every directory change, so a directory
/// frame recycled into a new address space always carries a clock newer than
/// any cached foreign-window state referring to its previous life.
static CHANGE_CLOCK: AtomicU64 = AtomicU64::new(1);

fn next_clock() -> u64 {
    CHANGE_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// One address space: the handle to a page directory frame.
///
/// All mutation of the tables behind this handle happens through the global
/// paging lock; the handle itself is freely shareable between threads.
/// Destruction is explicit ([`PageDir::destroy`]) because tearing down an
/// address space is kernel policy, not a side effect of dropping a handle.
pub struct PageDir {
    /// The directory frame backing this address space.
    phys: FrameNumber,
    /// Logical clock of the most recent directory-entry change.
    last_change: AtomicU64,
}

impl PageDir {
    fn from_root(phys: FrameNumber) -> Self {
        Self {
            phys,
            last_change: AtomicU64::new(next_clock()),
        }
    }

    /// Returns the directory frame, which doubles as this space's identity.
    pub(crate) fn phys(&self) -> FrameNumber {
        self.phys
    }

    pub(crate) fn last_change(&self) -> u64 {
        self.last_change.load(Ordering::Acquire)
    }

    /// Stamps a directory-entry change (a page table appeared or vanished).
    pub(crate) fn bump_change(&self) {
        self.last_change.store(next_clock(), Ordering::Release);
    }

    /// Returns the virtual address of the primary kernel-stack page, the
    /// topmost page of the kernel-stack area.
    pub fn kernel_stack_page() -> VirtualAddress {
        arch::slot_base(arch::KERNEL_STACK_SLOT) + (arch::ENTRY_COUNT - 1) * arch::PAGE_SIZE
    }

    /// Bootstraps the very first address space.
    ///
    /// Builds the directory by hand through the boot-time identity
    /// translator: a permanent page table for every shared kernel slot, the
    /// given kernel image frames mapped read-write supervisor/global at the
    /// bottom of kernel space (not owned — the loader placed them), a private
    /// kernel-stack table with one zeroed boot stack page, and the self-map
    /// slot. Activates the new space before returning it.
    ///
    /// On allocation failure every frame taken so far is returned.
    ///
    /// # Panics
    ///
    /// Panics if an address space is already active on this CPU, or if the
    /// image does not fit the kernel image area.
    pub fn init(kernel_image: &[FrameNumber]) -> Result<PageDir, MapError> {
        let _guard = sync::lock();
        assert!(
            cpu::active_dir().is_none(),
            "init must run before any address space is active"
        );

        let mut allocated: Vec<(FrameNumber, FrameClass)> = Vec::new();
        match Self::init_inner(kernel_image, &mut allocated) {
            Ok(root) => {
                cpu::current().set_active(root.phys);
                arch::activate(root.phys);
                log::info!(
                    "paging initialized: root directory frame {}, {} kernel image pages",
                    root.phys,
                    kernel_image.len()
                );
                Ok(root)
            }
            Err(error) => {
                for (frame, class) in allocated.into_iter().rev() {
                    frames::free(frame, class);
                }
                Err(error)
            }
        }
    }

    fn init_inner(
        kernel_image: &[FrameNumber],
        allocated: &mut Vec<(FrameNumber, FrameClass)>,
    ) -> Result<PageDir, MapError> {
        let image_capacity =
            (arch::KERNEL_STACK_SLOT - arch::KERNEL_SPACE_SLOT) * arch::ENTRY_COUNT;
        assert!(
            kernel_image.len() <= image_capacity,
            "kernel image does not fit the kernel image area"
        );

        let mut take = |class: FrameClass| -> Result<FrameNumber, MapError> {
            let frame = frames::allocate(class).ok_or(MapError::OutOfMemory)?;
            allocated.push((frame, class));
            Ok(frame)
        };

        let mut table_flags = PageFlags::empty();
        table_flags.set_present(true);
        table_flags.set_writable(true);
        table_flags.set_supervisor(true);

        let dir_frame = take(FrameClass::Critical)?;
        // SAFETY: physical memory is identity-reachable during bootstrap.
        let dir = unsafe { arch::TableRef::from_frame(dir_frame) };
        dir.zero();

        // Permanent page tables for every shared kernel slot. These are
        // copied verbatim into each cloned address space, so they must all
        // exist before the first clone.
        for slot in arch::KERNEL_SPACE_SLOT..arch::ENTRY_COUNT {
            if arch::is_shared_kernel_slot(slot) {
                let table_frame = take(FrameClass::Critical)?;
                // SAFETY: as above; the frame was just allocated.
                unsafe { arch::TableRef::from_frame(table_frame) }.zero();
                dir.set_entry(slot, PageEntry::new(table_frame, table_flags));
            }
        }

        // The kernel image sits at the bottom of kernel space. The frames are
        // marked no-free: the loader owns them, not these entries.
        let image_base = arch::slot_base(arch::KERNEL_SPACE_SLOT);
        let mut image_flags = PageFlags::empty();
        image_flags.set_present(true);
        image_flags.set_writable(true);
        image_flags.set_supervisor(true);
        image_flags.set_global(true);
        image_flags.set_no_free(true);
        for (i, &frame) in kernel_image.iter().enumerate() {
            let virt = image_base + i * arch::PAGE_SIZE;
            let table_frame = dir.entry(virt.dir_index()).frame();
            // SAFETY: the covering table was allocated above.
            let table = unsafe { arch::TableRef::from_frame(table_frame) };
            table.set_entry(virt.table_index(), PageEntry::new(frame, image_flags));
        }

        // Private kernel-stack table with one zeroed boot stack page.
        let kstack_table = take(FrameClass::Critical)?;
        // SAFETY: as above.
        let kstack = unsafe { arch::TableRef::from_frame(kstack_table) };
        kstack.zero();
        let kstack_page = take(FrameClass::Kernel)?;
        let stack_ptr: *mut u8 =
            AddressTranslator::current().phys_to_ptr(kstack_page.start().as_usize());
        // SAFETY: the frame was just allocated and is PAGE_SIZE bytes.
        unsafe { core::ptr::write_bytes(stack_ptr, 0, arch::PAGE_SIZE) };

        let mut stack_flags = PageFlags::empty();
        stack_flags.set_present(true);
        stack_flags.set_writable(true);
        stack_flags.set_supervisor(true);
        kstack.set_entry(
            arch::ENTRY_COUNT - 1,
            PageEntry::new(kstack_page, stack_flags),
        );
        dir.set_entry(
            arch::KERNEL_STACK_SLOT,
            PageEntry::new(kstack_table, table_flags),
        );

        dir.set_entry(arch::SELF_MAP_SLOT, PageEntry::new(dir_frame, table_flags));

        Ok(PageDir::from_root(dir_frame))
    }

    /// Clones `parent`'s kernel space into a fresh address space for `fork`.
    ///
    /// Kernel directory entries are copied verbatim — kernel mappings are
    /// identical across all address spaces and are *not* copy-on-write —
    /// except for the kernel-stack slot (a fresh private table with one
    /// zeroed stack page), the foreign-map slot (cleared) and the self-map
    /// slot (the child's own directory). User entries start empty.
    ///
    /// On allocation failure everything already allocated is freed.
    pub fn clone_kernel_space(parent: &PageDir) -> Result<PageDir, MapError> {
        let _guard = sync::lock();

        let dir_frame = frames::allocate(FrameClass::Critical).ok_or(MapError::OutOfMemory)?;
        let Some(kstack_table) = frames::allocate(FrameClass::Critical) else {
            frames::free(dir_frame, FrameClass::Critical);
            return Err(MapError::OutOfMemory);
        };
        let Some(kstack_page) = frames::allocate(FrameClass::Kernel) else {
            frames::free(kstack_table, FrameClass::Critical);
            frames::free(dir_frame, FrameClass::Critical);
            return Err(MapError::OutOfMemory);
        };

        let mut table_flags = PageFlags::empty();
        table_flags.set_present(true);
        table_flags.set_writable(true);
        table_flags.set_supervisor(true);

        let parent_view = view::open(parent);
        view::with_temp(dir_frame, |ptr| {
            // SAFETY: the temp slot maps the fresh directory frame.
            let dir = unsafe { arch::TableRef::from_ptr(ptr) };
            for slot in 0..arch::ENTRY_COUNT {
                let entry = if !arch::is_kernel_slot(slot) {
                    PageEntry::empty()
                } else if slot == arch::KERNEL_STACK_SLOT {
                    PageEntry::new(kstack_table, table_flags)
                } else if slot == arch::FOREIGN_MAP_SLOT {
                    PageEntry::empty()
                } else if slot == arch::SELF_MAP_SLOT {
                    PageEntry::new(dir_frame, table_flags)
                } else {
                    parent_view.pde(slot)
                };
                dir.set_entry(slot, entry);
            }
        });

        view::with_temp(kstack_table, |ptr| {
            // SAFETY: the temp slot maps the fresh table frame.
            let table = unsafe { arch::TableRef::from_ptr(ptr) };
            table.zero();
            let mut stack_flags = PageFlags::empty();
            stack_flags.set_present(true);
            stack_flags.set_writable(true);
            stack_flags.set_supervisor(true);
            table.set_entry(
                arch::ENTRY_COUNT - 1,
                PageEntry::new(kstack_page, stack_flags),
            );
        });
        view::zero_frame(kstack_page);

        let child = PageDir::from_root(dir_frame);
        log::trace!(
            "cloned kernel space of {} into new address space {}",
            parent.phys,
            child.phys
        );
        Ok(child)
    }

    /// Clones `count` pages from `src` at `virt_src` to `dst` at `virt_dst`.
    ///
    /// With `share` the entries are copied verbatim — true sharing, as used
    /// for memory-mapped files. Without it, every present page is marked
    /// copy-on-write read-only in **both** spaces and each space gets one
    /// ownership-ledger entry for the frame (the source only on the first
    /// share). Non-present entries are copied verbatim either way; absent
    /// slots are skipped.
    ///
    /// Returns the number of page tables created in `dst`. On allocation
    /// failure, pages already cloned into `dst` are removed again and the
    /// source's writable bits and ledger entries are restored.
    ///
    /// # Panics
    ///
    /// Panics unless `src` is the active address space: the foreign window
    /// can expose only one other space at a time, and `dst` needs it.
    pub fn clone_pages(
        src: &PageDir,
        dst: &PageDir,
        virt_src: VirtualAddress,
        virt_dst: VirtualAddress,
        count: usize,
        share: bool,
    ) -> Result<usize, MapError> {
        let _guard = sync::lock();
        mapping::check_range(virt_src, count);
        mapping::check_range(virt_dst, count);
        assert_eq!(
            cpu::active_dir(),
            Some(src.phys),
            "clone_pages requires the source address space to be active"
        );
        if count == 0 {
            return Ok(0);
        }

        let src_view = view::active_view();
        let dst_view = view::open(dst);
        let dst_active = dst_view.is_active();
        let mut rollback = Rollback::new();
        let mut tables_created = 0;

        let src_page = virt_src.page_number();
        let dst_page = virt_dst.page_number();
        for i in 0..count {
            let vs = (src_page + i).start();
            let vd = (dst_page + i).start();

            let src_entry = if src_view.pde(vs.dir_index()).is_present() {
                src_view.pte(vs)
            } else {
                PageEntry::empty()
            };
            if !src_entry.exists() {
                continue;
            }

            let user = !src_entry.flags().is_supervisor();
            if mapping::ensure_table(dst, dst_view, vd, user, &mut rollback)? {
                tables_created += 1;
            }
            let old_dst = dst_view.pte(vd);

            if share || !src_entry.is_present() {
                dst_view.set_pte(vd, src_entry);
                rollback.push(Undo::RestoreEntry {
                    space: dst,
                    view: dst_view,
                    virt: vd,
                    old: old_dst,
                    fresh_frame: None,
                });
            } else {
                let frame = src_entry.frame();
                let mut flags = src_entry.flags();

                // First share of this frame: demote the source to read-only
                // copy-on-write and register it as an owner. A page that is
                // already copy-on-write (an earlier fork) keeps its source
                // entry; only the new sharer is added.
                if !flags.is_copy_on_write() {
                    flags.set_writable(false);
                    flags.set_copy_on_write(true);
                    src_view.set_pte(vs, PageEntry::new(frame, flags));
                    arch::invalidate_page(vs);
                    cow::register(frame, src.phys);
                    rollback.push(Undo::Deregister {
                        frame,
                        owner: src.phys,
                    });
                    rollback.push(Undo::RestoreEntry {
                        space: src,
                        view: src_view,
                        virt: vs,
                        old: src_entry,
                        fresh_frame: None,
                    });
                }

                dst_view.set_pte(vd, PageEntry::new(frame, flags));
                cow::register(frame, dst.phys);
                rollback.push(Undo::Deregister {
                    frame,
                    owner: dst.phys,
                });
                rollback.push(Undo::RestoreEntry {
                    space: dst,
                    view: dst_view,
                    virt: vd,
                    old: old_dst,
                    fresh_frame: None,
                });
            }

            if dst_active {
                arch::invalidate_page(vd);
            }
        }

        rollback.disarm();
        if !dst_active {
            shootdown::notify(dst.phys, virt_dst, count);
        }
        Ok(tables_created)
    }

    /// Tears this address space down, returning its private frames to the
    /// allocator: kernel-stack pages and table, leftover copy-on-write
    /// registrations, and finally the directory frame itself.
    ///
    /// User pages are *not* walked here — the region manager must have
    /// unmapped every user region (with `free_frames`) before destroying the
    /// space. Stray user page tables are reclaimed with a warning; their
    /// pages are the region manager's leak to answer for.
    ///
    /// # Panics
    ///
    /// Panics if called on the address space active on this CPU.
    pub fn destroy(self) {
        let _guard = sync::lock();
        assert_ne!(
            cpu::active_dir(),
            Some(self.phys),
            "destroy() called on the active address space"
        );

        let dying = view::open(&self);

        let kstack_pde = dying.pde(arch::KERNEL_STACK_SLOT);
        let mut kstack_frames: Vec<FrameNumber> = Vec::new();
        if kstack_pde.is_present() {
            let table = dying.table_ref(arch::KERNEL_STACK_SLOT);
            for index in 0..arch::ENTRY_COUNT {
                let entry = table.entry(index);
                if entry.is_present() && !entry.flags().is_no_free() {
                    kstack_frames.push(entry.frame());
                }
            }
        }

        let mut user_tables: Vec<FrameNumber> = Vec::new();
        for slot in 0..arch::KERNEL_SPACE_SLOT {
            let pde = dying.pde(slot);
            if pde.is_present() {
                user_tables.push(pde.frame());
            }
        }
        if !user_tables.is_empty() {
            log::warn!(
                "destroying address space {} with {} user page tables still linked",
                self.phys,
                user_tables.len()
            );
        }

        let leftover = cow::drop_space(self.phys);
        if leftover > 0 {
            log::warn!(
                "destroying address space {} with {leftover} leftover copy-on-write registrations",
                self.phys
            );
        }

        // The foreign slot of the active space must not keep naming a frame
        // we are about to free.
        view::close_foreign(&self);

        for frame in kstack_frames {
            frames::free(frame, FrameClass::Kernel);
        }
        if kstack_pde.is_present() {
            frames::free(kstack_pde.frame(), FrameClass::Critical);
        }
        for table in user_tables {
            frames::free(table, FrameClass::Critical);
        }
        frames::free(self.phys, FrameClass::Critical);

        log::debug!("destroyed address space {}", self.phys);
    }

    /// Switches this CPU to this address space.
    ///
    /// # Safety
    ///
    /// The directory must map the kernel and itself — true for any `PageDir`
    /// produced by [`PageDir::init`] or [`PageDir::clone_kernel_space`] that
    /// has not been destroyed.
    pub unsafe fn activate(&self) {
        let _guard = sync::lock();
        cpu::current().set_active(self.phys);
        arch::activate(self.phys);
    }

    /// Returns true if the page containing `virt` is present.
    pub fn is_present(&self, virt: VirtualAddress) -> bool {
        let _guard = sync::lock();
        let view = view::open(self);
        let page = virt.align_down(arch::PAGE_SIZE);
        view.pde(page.dir_index()).is_present() && view.pte(page).is_present()
    }

    /// Returns the frame backing the page containing `virt`, if present.
    pub fn frame_of(&self, virt: VirtualAddress) -> Option<FrameNumber> {
        let _guard = sync::lock();
        let view = view::open(self);
        let page = virt.align_down(arch::PAGE_SIZE);
        if !view.pde(page.dir_index()).is_present() {
            return None;
        }
        let entry = view.pte(page);
        entry.is_present().then(|| entry.frame())
    }

    /// Returns the entry flags for the page containing `virt`, if its slot is
    /// allocated.
    pub fn entry_flags(&self, virt: VirtualAddress) -> Option<PageFlags> {
        let _guard = sync::lock();
        let view = view::open(self);
        let page = virt.align_down(arch::PAGE_SIZE);
        if !view.pde(page.dir_index()).is_present() {
            return None;
        }
        let entry = view.pte(page);
        entry.exists().then(|| entry.flags())
    }

    /// Logs every present page of this address space, per directory entry,
    /// as (table index, frame, permission bits). Diagnostics only.
    pub fn dump(&self) {
        let _guard = sync::lock();
        let view = view::open(self);

        log::debug!(
            "address space {} (last change {})",
            self.phys,
            self.last_change()
        );
        for slot in 0..arch::ENTRY_COUNT {
            // The self-map and foreign-map slots hold directories, not
            // page tables.
            if slot == arch::SELF_MAP_SLOT || slot == arch::FOREIGN_MAP_SLOT {
                continue;
            }
            let pde = view.pde(slot);
            if !pde.is_present() {
                continue;
            }
            log::debug!("  dir {:3}: table frame {}", slot, pde.frame());
            let table = view.table_ref(slot);
            for index in 0..arch::ENTRY_COUNT {
                let entry = table.entry(index);
                if !entry.exists() {
                    continue;
                }
                let flags = entry.flags();
                log::debug!(
                    "    {:3}: frame {:5} {}{}{}{}{}{}",
                    index,
                    entry.frame(),
                    if flags.is_present() { 'p' } else { '-' },
                    if flags.is_writable() { 'w' } else { '-' },
                    if flags.is_supervisor() { 's' } else { '-' },
                    if flags.is_global() { 'g' } else { '-' },
                    if flags.is_copy_on_write() { 'c' } else { '-' },
                    if flags.is_no_free() { 'n' } else { '-' },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameInput, MapFlags, access, testing};

    const V: VirtualAddress = VirtualAddress::new(0x0400);

    #[test]
    fn init_builds_the_kernel_space() {
        let machine = testing::boot();
        let root = &machine.root;

        let image_base = arch::slot_base(arch::KERNEL_SPACE_SLOT);
        assert!(root.is_present(image_base));
        let flags = root.entry_flags(image_base).unwrap();
        assert!(flags.is_supervisor());
        assert!(flags.is_global());
        assert!(flags.is_no_free());

        assert!(root.is_present(PageDir::kernel_stack_page()));
        assert!(!root.is_present(VirtualAddress::new(0)));
    }

    #[test]
    fn cloned_spaces_share_kernel_but_not_stacks() {
        let machine = testing::boot();
        let root = &machine.root;
        let child = PageDir::clone_kernel_space(root).unwrap();

        let image_base = arch::slot_base(arch::KERNEL_SPACE_SLOT);
        assert_eq!(root.frame_of(image_base), child.frame_of(image_base));

        let stack = PageDir::kernel_stack_page();
        assert!(child.is_present(stack));
        assert_ne!(root.frame_of(stack), child.frame_of(stack));

        assert!(!child.is_present(VirtualAddress::new(0)));
    }

    #[test]
    fn destroy_returns_private_frames() {
        let machine = testing::boot();
        let before = machine.alloc.free_count();

        let child = PageDir::clone_kernel_space(&machine.root).unwrap();
        // Directory + kernel-stack table + kernel-stack page.
        assert_eq!(machine.alloc.free_count(), before - 3);

        child.destroy();
        assert_eq!(machine.alloc.free_count(), before);
    }

    #[test]
    #[should_panic(expected = "active address space")]
    fn destroying_the_active_space_is_fatal() {
        let machine = testing::boot();
        machine.root.destroy();
    }

    #[test]
    fn clone_pages_with_share_copies_entries_verbatim() {
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
        PageDir::clone_pages(root, &child, V, V, 1, true).unwrap();

        assert_eq!(root.frame_of(V), child.frame_of(V));
        // True sharing: both stay writable, nothing is copy-on-write.
        assert!(root.entry_flags(V).unwrap().is_writable());
        assert!(child.entry_flags(V).unwrap().is_writable());
        assert!(!child.entry_flags(V).unwrap().is_copy_on_write());
    }

    #[test]
    fn clone_pages_to_a_different_destination_address() {
        let machine = testing::boot();
        let root = &machine.root;
        let other = VirtualAddress::new(0x1000);

        root.map(
            V,
            FrameInput::Allocate,
            1,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        assert!(access::write(root, V, b"moved"));

        let child = PageDir::clone_kernel_space(root).unwrap();
        PageDir::clone_pages(root, &child, V, other, 1, false).unwrap();

        unsafe { child.activate() };
        let mut buf = [0u8; 5];
        assert!(access::read(&child, other, &mut buf));
        assert_eq!(&buf, b"moved");
        unsafe { root.activate() };
    }

    #[test]
    fn failed_clone_restores_source_and_ledger() {
        let machine = testing::boot();
        let root = &machine.root;

        // Two pages in different tables, so the clone needs two fresh tables
        // in the destination.
        let far = VirtualAddress::new(0x1000);
        root.map(
            V,
            FrameInput::Allocate,
            1,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        root.map(
            far,
            FrameInput::Allocate,
            1,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        let child = PageDir::clone_kernel_space(root).unwrap();

        // One frame left: the first destination table succeeds, the second
        // does not.
        machine.alloc.drain_to(1);

        // The two source pages sit 0x0C00 apart; clone them as one range of
        // 25 pages (the pages between are absent and skipped).
        let count = (far - V) / arch::PAGE_SIZE + 1;
        let result = PageDir::clone_pages(root, &child, V, V, count, false);
        assert_eq!(result, Err(MapError::OutOfMemory));

        // The source is writable again and owns no ledger entries.
        assert!(root.entry_flags(V).unwrap().is_writable());
        assert!(!root.entry_flags(V).unwrap().is_copy_on_write());
        assert!(!cow::has_owner(root.frame_of(V).unwrap(), root.phys()));
        assert!(!child.is_present(V));
    }

    #[test]
    fn fork_write_fault_end_to_end() {
        let machine = testing::boot();
        let a = &machine.root;

        // Four pages at V backed by fresh frames.
        a.map(
            V,
            FrameInput::Allocate,
            4,
            MapFlags::PRESENT | MapFlags::WRITABLE,
        )
        .unwrap();
        for i in 0..4u8 {
            assert!(access::write(
                a,
                V + i as usize * arch::PAGE_SIZE,
                &[0x10 + i]
            ));
        }

        let b = PageDir::clone_kernel_space(a).unwrap();
        PageDir::clone_pages(a, &b, V, V, 4, false).unwrap();

        for i in 0..4 {
            let page = V + i * arch::PAGE_SIZE;
            for space in [a, &b] {
                let flags = space.entry_flags(page).unwrap();
                assert!(flags.is_copy_on_write());
                assert!(!flags.is_writable());
            }
            assert_eq!(a.frame_of(page), b.frame_of(page));
        }

        // A write fault in B at V+PAGE_SIZE gives B its own frame there.
        let target = V + arch::PAGE_SIZE;
        let a_frame = a.frame_of(target).unwrap();
        unsafe { b.activate() };
        assert!(access::write(&b, target, &[0xEE]));

        assert_ne!(b.frame_of(target), Some(a_frame));
        assert_eq!(a.frame_of(target), Some(a_frame));
        let a_flags = a.entry_flags(target).unwrap();
        assert!(a_flags.is_copy_on_write());

        // A still reads its original byte.
        unsafe { a.activate() };
        let mut buf = [0u8; 1];
        assert!(access::read(a, target, &mut buf));
        assert_eq!(buf[0], 0x11);

        // The untouched pages are still shared.
        assert_eq!(a.frame_of(V), b.frame_of(V));
    }

    #[test]
    fn dump_walks_every_present_entry() {
        let machine = testing::boot();
        machine
            .root
            .map(
                V,
                FrameInput::Allocate,
                2,
                MapFlags::PRESENT | MapFlags::WRITABLE,
            )
            .unwrap();
        // Exercises the walk; output goes to the logger.
        machine.root.dump();
    }
}
