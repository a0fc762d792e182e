use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// A 4 KiB physical page frame.
///
/// Stored as the **page frame number** (`address >> PAGE_SHIFT`), which is
/// what the boot allocator's bitmap and page-table entries index by.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let page = PhysicalPage::from_number(0x102);
/// assert_eq!(page.base(), PhysicalAddress::new(0x0010_2000));
/// assert_eq!(page.next().number(), 0x103);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// The frame containing `addr` (the in-page offset is discarded).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn from_number(pfn: u64) -> Self {
        Self(pfn)
    }

    /// Page frame number.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    /// First byte past the end of this frame.
    #[inline]
    #[must_use]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 << PAGE_SHIFT) + PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    #[must_use]
    pub const fn offset_by(self, pages: u64) -> Self {
        Self(self.0 + pages)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(pfn={:#x}, {:#018X})", self.0, self.base().as_u64())
    }
}
