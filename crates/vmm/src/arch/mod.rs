//! Architecture-specific implementations for paging.
//!
//! This module conditionally imports either the hardware implementation or
//! software emulation based on the target architecture and features.

// Use the x86 hardware implementation when we're on an x86-family target and
// not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86;
#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    not(test),
    not(feature = "software-emulation")
))]
pub use x86::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Returns true if the given directory slot belongs to kernel space.
#[inline]
pub(crate) const fn is_kernel_slot(slot: usize) -> bool {
    slot >= KERNEL_SPACE_SLOT
}

/// Returns true if the given directory slot is one of the reserved windows
/// (self-map, foreign-map, or temp-map) that ordinary mappings must not touch.
#[inline]
pub(crate) const fn is_reserved_slot(slot: usize) -> bool {
    slot == SELF_MAP_SLOT || slot == FOREIGN_MAP_SLOT || slot == TEMP_MAP_SLOT
}

/// Returns true if the given kernel directory slot is shared by all address
/// spaces and backed by a permanent page table allocated at boot.
///
/// The kernel-stack slot is private per address space; the self-map and
/// foreign-map slots hold directory frames, not page tables.
#[inline]
pub(crate) const fn is_shared_kernel_slot(slot: usize) -> bool {
    is_kernel_slot(slot)
        && slot != KERNEL_STACK_SLOT
        && slot != FOREIGN_MAP_SLOT
        && slot != SELF_MAP_SLOT
}
