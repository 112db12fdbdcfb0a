//! Emulated memory access through the active address space.
//!
//! This is the page-fault trap path in miniature, for tests and the
//! software-emulation feature: loads and stores resolve through the active
//! space's page tables the way the MMU would, and a faulting access hands
//! the address to [`PageDir::handle_page_fault`] before one retry — exactly
//! what the kernel's trap handler does on hardware.

use crate::{PageDir, VirtualAddress, arch, cpu};

fn access(
    space: &PageDir,
    virt: VirtualAddress,
    len: usize,
    write: bool,
    mut op: impl FnMut(usize, *mut u8),
) -> bool {
    let root = cpu::active_dir().expect("no active address space");
    assert_eq!(
        root,
        space.phys(),
        "emulated accesses go through the active address space"
    );

    for i in 0..len {
        let addr = virt + i;
        let mut faulted = false;
        loop {
            match arch::translate_checked(root, addr, write) {
                Ok(ptr) => {
                    op(i, ptr);
                    break;
                }
                Err(_) if !faulted => {
                    faulted = true;
                    if !space.handle_page_fault(addr) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
    }
    true
}

/// Reads `buf.len()` bytes at `virt` from the active address space.
///
/// Returns false if an access faults and the fault handler does not resolve
/// it.
pub fn read(space: &PageDir, virt: VirtualAddress, buf: &mut [u8]) -> bool {
    access(space, virt, buf.len(), false, |i, ptr| {
        // SAFETY: the walk resolved ptr to a mapped byte.
        buf[i] = unsafe { *ptr };
    })
}

/// Writes `bytes` at `virt` into the active address space, resolving
/// copy-on-write faults on the way.
///
/// Returns false if an access faults and the fault handler does not resolve
/// it.
pub fn write(space: &PageDir, virt: VirtualAddress, bytes: &[u8]) -> bool {
    access(space, virt, bytes.len(), true, |i, ptr| {
        // SAFETY: the walk resolved ptr to a mapped, writable byte.
        unsafe { *ptr = bytes[i] };
    })
}
