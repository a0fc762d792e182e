use crate::{PAGE_OFFSET_MASK, PAGE_SIZE, VirtualAddress};
use core::fmt;

/// A 4 KiB page-aligned slot in virtual memory.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.as_u64() & !PAGE_OFFSET_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn offset_by(self, pages: u64) -> Self {
        Self(self.0 + pages * PAGE_SIZE)
    }
}

impl TryFrom<VirtualAddress> for VirtualPage {
    type Error = VirtualAddress;

    /// Succeeds only for page-aligned addresses; returns the address back otherwise.
    fn try_from(value: VirtualAddress) -> Result<Self, Self::Error> {
        if value.is_page_aligned() {
            Ok(Self(value.as_u64()))
        } else {
            Err(value)
        }
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#018X})", self.0)
    }
}
