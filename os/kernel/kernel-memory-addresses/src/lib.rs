//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the addresses, page frames and address ranges
//! the early memory allocators operate on.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address in the kernel's virtual address space. |
//! | [`PhysicalPage`] | A 4 KiB physical page frame, identified by its frame number. |
//! | [`VirtualPage`] | A 4 KiB page-aligned slot in virtual memory. |
//! | [`PhysicalRange`] / [`VirtualRange`] | Half-open byte ranges `[start, end)`. |
//!
//! All allocators in this workspace work in units of 4 KiB pages, so unlike a
//! general paging library there is exactly one page size: [`PAGE_SIZE`].
//!
//! ## Rounding conventions
//!
//! The boot allocator distinguishes between pages **touched** by a byte range
//! (round the start down and the end up) and pages **fully covered** by it
//! (round the start up and the end down):
//!
//! ```text
//!   page p-1        page p          page p+1
//! |------------|------------|------------|
//!          [=========== range ======]
//! touched:  p-1 .. p+1 (three pages)
//! covered:  p  (one page)
//! ```
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let range = PhysicalRange::new(PhysicalAddress::new(0x0fff), PhysicalAddress::new(0x3001));
//! assert_eq!(range.pages_touched(), 0..4);
//! assert_eq!(range.pages_covered(), 1..3);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` over `u64` and implement `Copy`,
//!   `Eq`, `Ord` and `Hash`.
//! - Alignment helpers are `const fn` and assume power-of-two alignments.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod range;
mod virtual_address;
mod virtual_page;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::range::{PhysicalRange, VirtualRange};
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page frame in bytes (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Number of whole pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_of_address_roundtrips() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let page = pa.page();
        assert_eq!(page.base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(page.number(), 0x0000_0010_2000_0000 >> PAGE_SHIFT);
        assert_eq!(pa.page_offset(), 0x42);
        assert_eq!(page.base() + pa.page_offset(), pa);
    }

    #[test]
    fn virtual_and_physical_pages_are_distinct_kinds() {
        let va = VirtualAddress::new(0xFFFF_C900_0000_1234);
        let vp = va.page();
        assert_eq!(vp.base().as_u64(), 0xFFFF_C900_0000_1000);
        assert_eq!(vp.next().base().as_u64(), 0xFFFF_C900_0000_2000);
        assert_eq!(va.page_offset(), 0x234);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, PAGE_SIZE), 0x12000);
        assert_eq!(align_up(0x12345, PAGE_SIZE), 0x13000);
        assert_eq!(align_up(0x13000, PAGE_SIZE), 0x13000);
        assert_eq!(pages_for(3 * PAGE_SIZE + 1), 4);
    }

    #[test]
    fn offsets_and_distances() {
        let pa = PhysicalAddress::new(0x5000);
        assert_eq!(pa + PAGE_SIZE - 1, PhysicalAddress::new(0x5fff));
        assert_eq!(pa - 0x10, PhysicalAddress::new(0x4ff0));
        assert_eq!(pa - PhysicalAddress::new(0x1000), 0x4000);

        let mut va = VirtualAddress::new(0xFFFF_C900_0000_2000);
        va -= PAGE_SIZE;
        assert_eq!(va, VirtualAddress::new(0xFFFF_C900_0000_1000));
        assert_eq!(va - VirtualAddress::new(0xFFFF_C900_0000_0000), PAGE_SIZE);
    }
}
