//! Per-CPU paging state.
//!
//! Each CPU tracks which address space it is running, the staleness clock of
//! the foreign window it last installed, and a lock over its temp-map slot.
//! The foreign-window fields are a cache only: window validity is always
//! re-derived from the foreign-slot directory entry itself (see
//! [`crate::view`]), so one CPU's cache can never vouch for another CPU's
//! window.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::FrameNumber;

const NO_SPACE: usize = usize::MAX;

/// Paging state of one CPU.
pub(crate) struct CpuState {
    /// Directory frame of the currently active address space.
    active: AtomicUsize,
    /// Directory frame of the foreign space this CPU last installed a window
    /// for.
    foreign_target: AtomicUsize,
    /// The target's change clock observed when the window was last flushed.
    foreign_clock: AtomicU64,
    /// Serializes use of this CPU's temp-map slot across call sites.
    pub(crate) temp_busy: spin::Mutex<()>,
}

impl CpuState {
    const fn new() -> Self {
        Self {
            active: AtomicUsize::new(NO_SPACE),
            foreign_target: AtomicUsize::new(NO_SPACE),
            foreign_clock: AtomicU64::new(0),
            temp_busy: spin::Mutex::new(()),
        }
    }

    /// Returns the directory frame of the active address space, if any.
    pub(crate) fn active(&self) -> Option<FrameNumber> {
        match self.active.load(Ordering::Acquire) {
            NO_SPACE => None,
            frame => Some(FrameNumber::new(frame)),
        }
    }

    /// Records the active address space.
    pub(crate) fn set_active(&self, root: FrameNumber) {
        self.active.store(root.as_usize(), Ordering::Release);
    }

    /// Returns true if this CPU last installed (and flushed) a foreign window
    /// for `target` no earlier than the given change clock.
    pub(crate) fn foreign_fresh(&self, target: FrameNumber, last_change: u64) -> bool {
        self.foreign_target.load(Ordering::Acquire) == target.as_usize()
            && last_change <= self.foreign_clock.load(Ordering::Acquire)
    }

    /// Records a freshly installed and flushed foreign window.
    pub(crate) fn record_foreign(&self, target: FrameNumber, clock: u64) {
        self.foreign_target
            .store(target.as_usize(), Ordering::Release);
        self.foreign_clock.store(clock, Ordering::Release);
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
mod imp {
    use super::CpuState;
    use crate::arch;

    static CPUS: [CpuState; arch::MAX_CPUS] = [const { CpuState::new() }; arch::MAX_CPUS];

    /// Resolver mapping "this CPU" to an index, installed by the SMP layer.
    /// Before SMP bring-up only the boot CPU runs, so the default is index 0.
    static CPU_ID: spin::Once<fn() -> usize> = spin::Once::new();

    /// Installs the CPU-id resolver. Must be called before secondary CPUs
    /// start issuing paging operations.
    ///
    /// # Panics
    ///
    /// Panics if a resolver has already been installed.
    pub fn set_cpu_id_resolver(resolver: fn() -> usize) {
        if CPU_ID.get().is_some() {
            panic!("CPU id resolver already set");
        }
        CPU_ID.call_once(|| resolver);
    }

    pub(crate) fn id() -> usize {
        let id = CPU_ID.get().map(|f| f()).unwrap_or(0);
        assert!(id < arch::MAX_CPUS, "CPU id out of range");
        id
    }

    pub(crate) fn current() -> &'static CpuState {
        &CPUS[id()]
    }
}

#[cfg(any(test, feature = "software-emulation"))]
mod imp {
    use super::CpuState;

    // Each test thread models one single-CPU machine.
    std::thread_local! {
        static CPU: CpuState = const { CpuState::new() };
    }

    pub(crate) fn id() -> usize {
        0
    }

    pub(crate) fn current() -> &'static CpuState {
        CPU.with(|c| {
            // SAFETY: We leak the reference to make it 'static. The
            // thread-local lives for the entire duration of the thread and is
            // never accessed from another thread.
            unsafe { &*(c as *const CpuState) }
        })
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
pub use imp::set_cpu_id_resolver;

pub(crate) use imp::{current, id};

/// Returns the directory frame of the address space active on this CPU.
pub(crate) fn active_dir() -> Option<FrameNumber> {
    current().active()
}
