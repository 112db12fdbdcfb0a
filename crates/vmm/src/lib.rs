#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Altair Virtual Memory Manager (VMM)
//!
//! The Altair Virtual Memory Manager (VMM) is the address-space core of the
//! Altair kernel. It provides:
//!
//! - Two-level hierarchical page tables with a recursive self-mapping, so the
//!   active address space's own tables are addressable as ordinary memory.
//! - A foreign-map window for manipulating *another* address space's tables
//!   without switching to it.
//! - Demand copy-on-write paging backed by a global frame-ownership ledger.
//! - Address-space lifecycle: bootstrap, kernel-space cloning for `fork`,
//!   page cloning/sharing, and teardown.
//! - Software emulation for testing in non-kernel environments.
//!
//! The physical frame allocator, the scheduler, and cross-CPU TLB shootdown
//! delivery are external collaborators, reached through the [`FrameAllocator`]
//! and [`TlbShootdown`] traits.

extern crate alloc;

mod address;
mod arch;
mod cow;
mod cpu;
mod frames;
mod mapping;
mod numbers;
mod page_dir;
mod shootdown;
mod sync;
mod view;

#[cfg(any(test, feature = "software-emulation"))]
pub mod access;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use frames::{FrameAllocator, FrameClass, set_allocator};
pub use mapping::{FrameInput, MapError, MapFlags};
pub use numbers::{FrameNumber, PageNumber};
pub use page_dir::PageDir;
pub use shootdown::{TlbShootdown, set_shootdown};

pub use arch::{PAGE_SIZE, PageEntry, PageFlags};

#[cfg(not(any(test, feature = "software-emulation")))]
pub use cpu::set_cpu_id_resolver;
