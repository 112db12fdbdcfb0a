//! The boundary to the external physical frame allocator.
//!
//! The paging core never owns physical memory; it draws frames from, and
//! returns them to, whatever allocator the kernel installs here once during
//! bring-up. The class parameter selects which pool the allocator draws
//! from and does not affect paging logic.

use crate::FrameNumber;

/// Which allocator pool a frame request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Frames the kernel cannot operate without (page directories and tables).
    Critical,
    /// Kernel data frames (kernel stacks).
    Kernel,
    /// User data frames.
    User,
}

/// The external physical frame allocator.
///
/// Implemented by the kernel's physical memory manager and installed once via
/// [`set_allocator`].
pub trait FrameAllocator: Sync {
    /// Allocates one frame from the given pool, or None when the pool is
    /// exhausted.
    fn allocate(&self, class: FrameClass) -> Option<FrameNumber>;

    /// Returns one frame to the given pool.
    fn free(&self, frame: FrameNumber, class: FrameClass);

    /// Returns the number of free frames across all pools.
    fn free_frames(&self) -> usize;
}

/// Global frame allocator.
///
/// Installed once during kernel bring-up. In test/software-emulation mode this
/// is thread-local so that each test thread has its own allocator over its own
/// emulated memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static FRAME_ALLOCATOR: spin::Once<&'static dyn FrameAllocator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static FRAME_ALLOCATOR: spin::Once<&'static dyn FrameAllocator> = spin::Once::new();
}

/// Sets the global frame allocator.
///
/// This function must be called exactly once during initialization.
///
/// # Panics
///
/// Panics if the allocator has already been set.
pub fn set_allocator(allocator: &'static dyn FrameAllocator) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if FRAME_ALLOCATOR.get().is_some() {
            panic!("frame allocator already set");
        }
        FRAME_ALLOCATOR.call_once(|| allocator);
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        FRAME_ALLOCATOR.with(|a| {
            if a.get().is_some() {
                panic!("frame allocator already set");
            }
            a.call_once(|| allocator);
        });
    }
}

/// Returns the installed frame allocator.
///
/// # Panics
///
/// Panics if no allocator has been installed yet.
pub(crate) fn current() -> &'static dyn FrameAllocator {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        *FRAME_ALLOCATOR
            .get()
            .expect("frame allocator not set; call set_allocator during initialization")
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        FRAME_ALLOCATOR.with(|a| {
            *a.get()
                .expect("frame allocator not set; call set_allocator during initialization")
        })
    }
}

/// Allocates one frame from the given pool.
pub(crate) fn allocate(class: FrameClass) -> Option<FrameNumber> {
    current().allocate(class)
}

/// Returns one frame to the given pool.
pub(crate) fn free(frame: FrameNumber, class: FrameClass) {
    current().free(frame, class);
}
