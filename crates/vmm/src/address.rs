//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and
//! virtual addresses, plus the [`AddressTranslator`] the boot path and the
//! software backend use to reach physical frames before (or instead of) the
//! paging windows.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Translates between physical addresses and directly usable pointers.
///
/// Two modes exist:
/// - Hardware: physical memory is reachable at a fixed offset. The boot path
///   runs with offset zero (identity mapping) while it builds the first
///   address space; after that, all frame access goes through the paging
///   windows and this translator is no longer consulted.
/// - Emulated: physical memory is a buffer owned by the test harness.
pub enum AddressTranslator {
    /// Hardware translation using a fixed physical-to-virtual offset.
    Hardware { direct_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given offset.
    pub const fn hardware(direct_offset: usize) -> Self {
        Self::Hardware { direct_offset }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get().expect(
                "address translator not set; call AddressTranslator::set_current during initialization",
            )
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: We leak the reference to make it 'static. This is safe because:
                // 1. In test mode, each thread has its own ADDRESS_TRANSLATOR
                // 2. Once set, it's never modified (spin::Once guarantees this)
                // 3. The thread-local lives for the entire duration of the thread
                unsafe {
                    &*(t.get().expect(
                        "address translator not set; call AddressTranslator::set_current during initialization",
                    ) as *const AddressTranslator)
                }
            })
        }
    }

    /// Returns the current global address translator if it has been set.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        ADDRESS_TRANSLATOR.with(|t| {
            t.get().map(|translator| {
                // SAFETY: Same reasoning as current() - we leak the reference for 'static lifetime
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    /// Translates a physical address to a pointer the kernel can dereference.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        match self {
            Self::Hardware { direct_offset } => phys.wrapping_add(*direct_offset) as *mut T,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as *mut T,
        }
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> usize {
        match self {
            Self::Hardware { direct_offset } => (ptr as usize).wrapping_sub(*direct_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(ptr as *const u8),
        }
    }

    /// Allocates memory from the emulated space (test mode only).
    ///
    /// Returns the physical address of the allocated block, or None if
    /// there's not enough space.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => {
                panic!("cannot allocate from hardware translator")
            }
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }
}

/// Global address translator.
///
/// Initialized once during kernel bring-up (with the Hardware variant). In
/// test/software-emulation mode this is thread-local so that each test thread
/// has its own emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Macro to define common address type functionality.
///
/// Generates the basic structure and methods shared by the physical and
/// virtual address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     A newtype wrapper around the architecture-dependent representation of a\n\
     physical address, with methods for address manipulation and alignment checks."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     A newtype wrapper around the architecture-dependent representation of a\n\
     virtual address, with methods for address manipulation, alignment checks,\n\
     and extracting page-directory and page-table indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_virtual(addr),
            "address is not canonical"
        );
        Self(addr)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the byte offset within the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page-directory index for this address: which directory
    /// entry covers the page table responsible for it.
    #[inline]
    pub const fn dir_index(self) -> usize {
        arch::dir_index(self.0)
    }

    /// Returns the page-table index for this address: which entry within the
    /// covering page table maps it.
    #[inline]
    pub const fn table_index(self) -> usize {
        arch::table_index(self.0)
    }

    /// Returns true if this address lies in kernel space.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        arch::dir_index(self.0) >= arch::KERNEL_SPACE_SLOT
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub fn page_number(self) -> crate::PageNumber {
        crate::PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(addr.as_usize(), 0x0100);
        }

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 4);
            assert!(addr.is_aligned(arch::PAGE_SIZE));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(arch::PAGE_SIZE * 8));
        }

        #[test]
        fn align_down_and_up() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE + 4);
            assert_eq!(
                addr.align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE)
            );
            assert_eq!(
                addr.align_up(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE * 2)
            );
        }

        #[test]
        fn arithmetic_operators() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!((addr + 0x50).as_usize(), 0x0150);
            assert_eq!((addr - 0x80).as_usize(), 0x0080);
            assert_eq!(PhysicalAddress::new(0x0150) - addr, 0x50);
        }

        #[test]
        fn frame_number_round_trip() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3);
            assert_eq!(addr.frame_number().start(), addr);
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn new_valid_lower_half() {
            let addr = VirtualAddress::new(0x0100);
            assert_eq!(addr.as_usize(), 0x0100);
        }

        #[test]
        fn new_valid_upper_half() {
            let upper = arch::canonicalize_virtual(1 << (arch::MAX_VIRTUAL_BITS - 1));
            let addr = VirtualAddress::new(upper);
            assert_eq!(addr.as_usize(), upper);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn new_non_canonical() {
            // Upper-half bit set without sign extension.
            VirtualAddress::new(1 << (arch::MAX_VIRTUAL_BITS - 1));
        }

        #[test]
        fn page_offset() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE + 5);
            assert_eq!(addr.page_offset(), 5);
        }

        #[test]
        fn indices_split_the_address() {
            // One page into table 1 of directory slot 2.
            let raw = (2 << (arch::TABLE_INDEX_SHIFT + arch::INDEX_BITS))
                | (1 << arch::TABLE_INDEX_SHIFT);
            let addr = VirtualAddress::new(arch::canonicalize_virtual(raw));
            assert_eq!(addr.dir_index(), 2);
            assert_eq!(addr.table_index(), 1);
            assert_eq!(addr.page_offset(), 0);
        }

        #[test]
        fn kernel_split() {
            let user = VirtualAddress::new(0);
            assert!(!user.is_kernel());

            let kernel = arch::slot_base(arch::KERNEL_SPACE_SLOT);
            assert!(kernel.is_kernel());
        }

        #[test]
        fn arithmetic_operators() {
            let addr = VirtualAddress::new(0x0100);
            assert_eq!((addr + 0x50).as_usize(), 0x0150);
            assert_eq!((addr - 0x80).as_usize(), 0x0080);
            assert_eq!(VirtualAddress::new(0x0150) - addr, 0x50);
        }
    }
}
