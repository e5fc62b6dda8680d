//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address. The virtual memory subsystem works with two kinds of addresses:
//! [`Va`] for user (and kernel) virtual addresses that a process faults on,
//! and [`Pa`] for physical addresses of frames carved from the user pool.
//!
//! Both types support arithmetic operations (addition, subtraction, bitwise
//! operations), which allow straightforward address arithmetic.
//!
//! ## Example Usage:
//!
//! ```
//! use keos_vm::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x4000_1234).unwrap();
//! assert_eq!(va.page_down(), Va::new(0x4000_1000).unwrap());
//! assert_eq!((va + PAGE_SIZE).page_down(), Va::new(0x4000_2000).unwrap());
//! ```

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB. It is
/// the unit of lazy loading, eviction, swapping, and file mapping.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// The first address of the kernel half of the address space.
///
/// Every address at or above this boundary belongs to the kernel; user page
/// faults on such addresses are always fatal.
pub const KERNEL_BASE: usize = 0xffff_8000_0000_0000;

/// The top of the user stack.
///
/// The user program stack always starts at this address and grows downward.
pub const USER_STACK: usize = 0x4748_0000;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents the physical address of a frame handed out by the user
/// pool.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be less than `0xffff_0000_0000_0000`, which ensures
    /// it falls within the valid physical address range.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address is valid.
    /// - `None` if the address is outside the valid range.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The address must be canonical: its upper 17 bits are either all zero (user
/// half) or all one (kernel half).
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Returns
    /// - `Some(Va)` if the address is canonical.
    /// - `None` otherwise.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast the virtual address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the virtual address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the virtual address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address lies on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Returns `true` if the address is a non-null user address.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 != 0 && self.0 < KERNEL_BASE
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:#x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(Va::new(0x4000_0000).is_some());
        assert!(Va::new(KERNEL_BASE).is_some());
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
        assert!(Pa::new(0xffff_0000_0000_0000).is_none());
    }

    #[test]
    fn user_range() {
        assert!(!Va::new(0).unwrap().is_user());
        assert!(Va::new(USER_STACK - 1).unwrap().is_user());
        assert!(!Va::new(KERNEL_BASE + PAGE_SIZE).unwrap().is_user());
    }

    #[test]
    fn page_rounding() {
        let va = Va::new(0x1234).unwrap();
        assert_eq!(va.page_down().into_usize(), 0x1000);
        assert_eq!(va.page_up().into_usize(), 0x2000);
        assert_eq!(va.offset(), 0x234);
        assert!(!va.is_page_aligned());
        assert!(va.page_down().is_page_aligned());
        assert_eq!((va + PAGE_SIZE) - va, PAGE_SIZE);
    }
}
