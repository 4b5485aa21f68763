//! # Physical and Virtual Memory Addresses
//!
//! Strongly typed wrappers for the two address kinds the memory subsystem
//! juggles, plus the page-granular arithmetic every allocator and page-table
//! walker needs.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A location in physical RAM or an MMIO window. |
//! | [`VirtualAddress`] | A location in some address space, translated by the MMU. |
//!
//! Both are `#[repr(transparent)]` over `u64`, `Copy`, `Ord` and `Hash`, so they
//! can be used as sort keys and map keys without ceremony.
//!
//! ## Page Granularity
//!
//! All supported MMUs use a 4 KiB base granule. Larger leaves (2 MiB, 1 GiB,
//! 512 GiB) are always a power-of-512 multiple of it and are derived from the
//! walk level, so only the base granule is a crate constant:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);
//!
//! let pa = PhysicalAddress::new(0x1000_0042);
//! assert_eq!(pa.page_base(), PhysicalAddress::new(0x1000_0000));
//! assert_eq!(pa.page_offset(), 0x42);
//! assert!(!pa.is_page_aligned());
//!
//! assert_eq!(pages_for(0x1001), 2);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page (and page-table) size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align `x` down to a power-of-two `a`.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
/// assert_eq!(align_down(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to a power-of-two `a`, or `None` if that overflows `u64`.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
/// assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
/// assert_eq!(align_up(u64::MAX, 0x1000), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of the power-of-two `a`.
#[inline]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    debug_assert!(a.is_power_of_two());
    x & (a - 1) == 0
}

/// Number of base pages needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Bytes covered by `pages` base pages.
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: usize) -> u64 {
    (pages as u64) << PAGE_SHIFT
}
