//! Shared bring-up for unit tests.
//!
//! Every test thread is one emulated single-CPU machine: its own emulated
//! physical memory, its own frame allocator, its own paging state. `boot`
//! wires all of it and hands back the root address space.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    AddressTranslator, FrameAllocator, FrameClass, FrameNumber, PageDir, arch, frames,
};

/// Number of emulated frames per test machine.
const TEST_FRAMES: usize = 96;

/// A counting free-list allocator over the emulated physical memory.
pub(crate) struct TestAllocator {
    free: spin::Mutex<Vec<FrameNumber>>,
    allocations: AtomicUsize,
}

impl TestAllocator {
    fn new(frames: Vec<FrameNumber>) -> Self {
        Self {
            free: spin::Mutex::new(frames),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Hands a frame to the test itself, outside the allocation counter.
    pub(crate) fn take_frame(&self) -> FrameNumber {
        self.free.lock().pop().expect("emulated memory exhausted")
    }

    /// Number of frames currently free.
    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of `allocate` calls the paging core has made.
    pub(crate) fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Discards free frames until only `keep` remain, to provoke
    /// out-of-memory paths.
    pub(crate) fn drain_to(&self, keep: usize) {
        let mut free = self.free.lock();
        free.truncate(keep);
    }
}

impl FrameAllocator for TestAllocator {
    fn allocate(&self, _class: FrameClass) -> Option<FrameNumber> {
        let frame = self.free.lock().pop();
        if frame.is_some() {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    fn free(&self, frame: FrameNumber, _class: FrameClass) {
        self.free.lock().push(frame);
    }

    fn free_frames(&self) -> usize {
        self.free_count()
    }
}

/// One booted emulated machine.
pub(crate) struct Machine {
    pub(crate) root: PageDir,
    pub(crate) alloc: &'static TestAllocator,
}

/// Boots a fresh machine on this test thread: emulated memory, frame
/// allocator, and the bootstrap address space with a two-page kernel image.
pub(crate) fn boot() -> Machine {
    AddressTranslator::set_current(AddressTranslator::emulated(TEST_FRAMES * arch::PAGE_SIZE));
    let translator = AddressTranslator::current();

    let mut free: Vec<FrameNumber> = (0..TEST_FRAMES)
        .map(|_| {
            let phys = translator
                .allocate(arch::PAGE_SIZE, arch::PAGE_SIZE)
                .expect("emulated memory exhausted");
            FrameNumber::new(phys / arch::PAGE_SIZE)
        })
        .collect();
    // Pop from the low end first; failures read better with small numbers.
    free.reverse();

    let alloc: &'static TestAllocator = Box::leak(Box::new(TestAllocator::new(free)));
    frames::set_allocator(alloc);

    let image = [alloc.take_frame(), alloc.take_frame()];
    let root = PageDir::init(&image).expect("bootstrap failed");
    Machine { root, alloc }
}
