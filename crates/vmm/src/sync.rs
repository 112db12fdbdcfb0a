//! The global paging lock.
//!
//! One coarse lock serializes every mutation of any page table, directory,
//! window, or ledger entry, regardless of which address space is targeted.
//! This avoids lock-ordering deadlocks between the many cross-address-space
//! operations; every public operation acquires it on entry and releases it on
//! return, including error paths (the guard is RAII). Internal helpers never
//! re-acquire it.
//!
//! The ledger's own mutex and the per-CPU temp-slot mutexes nest strictly
//! inside this lock.

/// Global paging lock.
///
/// In test/software-emulation mode the lock is thread-local: each test thread
/// is an isolated machine with its own emulated memory, and a `should_panic`
/// test that unwinds while holding a truly global spinlock would wedge every
/// other test.
#[cfg(not(any(test, feature = "software-emulation")))]
static PAGING_LOCK: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static PAGING_LOCK: spin::Mutex<()> = const { spin::Mutex::new(()) };
}

/// Acquires the global paging lock for the duration of one public operation.
pub(crate) fn lock() -> spin::MutexGuard<'static, ()> {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        PAGING_LOCK.lock()
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        PAGING_LOCK.with(|l| {
            // SAFETY: We leak the reference to make it 'static. This is safe
            // because the thread-local lives for the entire duration of the
            // thread and the guard cannot outlive the thread that took it.
            unsafe { &*(l as *const spin::Mutex<()>) }.lock()
        })
    }
}
