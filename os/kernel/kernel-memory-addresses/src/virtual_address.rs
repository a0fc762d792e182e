use crate::{PAGE_OFFSET_MASK, VirtualPage, align_down, align_up};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Virtual memory address.
///
/// Does not validate canonicality; it only keeps virtual and physical values
/// apart at the type level.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_C900_0000_1234);
/// assert_eq!(va.page().base().as_u64(), 0xFFFF_C900_0000_1000);
/// assert_eq!(va.page_offset(), 0x234);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
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

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The page slot containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::containing(self)
    }

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
    pub const fn align_down(self, align: u64) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self(align_up(self.0, align))
    }

    /// Adds `rhs` bytes, returning `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(a: VirtualAddress) -> Self {
        a.0
    }
}

impl From<VirtualPage> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<u64> for VirtualAddress {
    #[inline]
    fn sub_assign(&mut self, rhs: u64) {
        self.0 -= rhs;
    }
}

/// Distance in bytes between two virtual addresses.
impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
