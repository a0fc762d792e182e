//! # Virtual Memory Support
//!
//! Minimal x86-64 paging layer for the kernel's early memory allocators.
//!
//! ## What you get
//! - An [`AddressSpace`] describing a `PML4` root page table, with exactly
//!   the operations the allocators rely on: ensure a 4 KiB mapping exists,
//!   remove it, translate, and copy a top-level entry between spaces.
//! - A bitfield [`PageTableEntry`] shared by all four levels.
//! - A 4 KiB-aligned [`PageTable`] with atomic entries and [`Level`] index helpers.
//! - The allocator/mapper seams [`FrameAlloc`] and [`PhysMapper`].
//! - With the `testing` feature: a simulated physical memory
//!   ([`testing::TestPhys`]) and a bump frame allocator.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB page
//!             │        │
//!             │        └─► PS=1: 2 MiB leaf
//!             └──────────► PS=1: 1 GiB leaf
//! ```
//!
//! One PML4 entry spans 512 GiB. Kernel windows such as the `vmalloc` area
//! are aligned to whole PML4 entries so that sharing them between address
//! spaces only ever requires copying top-level entries.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod address_space;
mod entry;
pub mod table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::address_space::{AddressSpace, MapError, UnmapError};
pub use crate::entry::PageTableEntry;
pub use crate::table::{Level, PageTable, TableIndex};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Source of physical 4 KiB frames for page tables.
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        (**self).alloc_4k()
    }
}

/// Converts physical addresses to pointers usable in the current address
/// space (an identity map in a loader, the HHDM in the kernel).
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be accessed.
    ///
    /// Computing the pointer is safe; dereferencing it is not.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// View the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable for `'a` and suitably aligned for `T`.
    /// - The bytes must be a valid `T` and not aliased by another `&mut`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Shared view of the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// Same as [`phys_to_mut`](Self::phys_to_mut), except shared aliases are
    /// allowed; `T` must tolerate concurrent access (atomics).
    #[inline]
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        unsafe { &*self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Byte view of `[pa, pa + len)`.
    ///
    /// # Safety
    /// The range must be mapped, contiguous in the mapping and not otherwise
    /// borrowed for `'a`.
    #[inline]
    unsafe fn phys_to_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(pa), len) }
    }

    /// Fill one frame with zeros.
    ///
    /// # Safety
    /// The frame must be mapped writable and not in use by anyone else.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn zero_page(&self, page: PhysicalPage) {
        unsafe { self.phys_to_bytes(page.base(), PAGE_SIZE as usize).fill(0) };
    }
}
