use crate::{PAGE_OFFSET_MASK, PhysicalPage, align_down, align_up};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Physical memory address.
///
/// Denotes a byte in host RAM or in an MMIO window. The type only carries
/// intent; it performs no validation.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0010_2042);
/// assert_eq!(pa.page().base().as_u64(), 0x0010_2000);
/// assert_eq!(pa.page_offset(), 0x42);
/// assert!(!pa.is_page_aligned());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page frame containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage::containing(self)
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self(align_up(self.0, align))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(a: PhysicalAddress) -> Self {
        a.0
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage) -> Self {
        value.base()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<u64> for PhysicalAddress {
    #[inline]
    fn sub_assign(&mut self, rhs: u64) {
        self.0 -= rhs;
    }
}

/// Distance in bytes between two physical addresses.
impl Sub for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
