//! The boundary to cross-CPU TLB shootdown delivery.
//!
//! Mutating a mapping invalidates the local TLB entry immediately, but other
//! CPUs that run (or cache a window into) the same address space must be told
//! to flush too. Delivering that interrupt is the SMP layer's job; the paging
//! core only reports what changed through this hook. Nothing is reported on
//! a single-CPU system where no hook is installed.

use crate::{FrameNumber, VirtualAddress};

/// Receiver for cross-CPU TLB flush requests.
pub trait TlbShootdown: Sync {
    /// Called after a mapping change in the address space rooted at `space`
    /// covering `count` pages from `virt`. The receiver must flush the range
    /// on every other CPU that may hold translations for that space.
    fn notify(&self, space: FrameNumber, virt: VirtualAddress, count: usize);
}

#[cfg(not(any(test, feature = "software-emulation")))]
static SHOOTDOWN: spin::Once<&'static dyn TlbShootdown> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static SHOOTDOWN: spin::Once<&'static dyn TlbShootdown> = spin::Once::new();
}

/// Sets the global shootdown receiver.
///
/// # Panics
///
/// Panics if a receiver has already been set.
pub fn set_shootdown(receiver: &'static dyn TlbShootdown) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if SHOOTDOWN.get().is_some() {
            panic!("TLB shootdown receiver already set");
        }
        SHOOTDOWN.call_once(|| receiver);
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        SHOOTDOWN.with(|s| {
            if s.get().is_some() {
                panic!("TLB shootdown receiver already set");
            }
            s.call_once(|| receiver);
        });
    }
}

/// Reports a mapping change to the installed receiver, if any.
pub(crate) fn notify(space: FrameNumber, virt: VirtualAddress, count: usize) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if let Some(receiver) = SHOOTDOWN.get() {
            receiver.notify(space, virt, count);
        }
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        SHOOTDOWN.with(|s| {
            if let Some(receiver) = s.get() {
                receiver.notify(space, virt, count);
            }
        });
    }
}
