use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use core::fmt;
use core::ops::Range;

/// Half-open physical byte range `[start, end)`.
///
/// Page helpers return page frame numbers, matching how the boot allocator
/// indexes its bitmap.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    end: PhysicalAddress,
}

impl PhysicalRange {
    /// Creates a range; an inverted pair collapses to an empty range at `start`.
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        let end = if end.as_u64() < start.as_u64() { start } else { end };
        Self { start, end }
    }

    /// Creates `[start, start + len)`, saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn from_start_len(start: PhysicalAddress, len: u64) -> Self {
        Self::new(start, PhysicalAddress::new(start.as_u64().saturating_add(len)))
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    /// Frame numbers of every page that shares at least one byte with the range.
    #[inline]
    #[must_use]
    pub const fn pages_touched(&self) -> Range<u64> {
        if self.is_empty() {
            let pfn = self.start.as_u64() >> PAGE_SHIFT;
            return pfn..pfn;
        }
        (align_down(self.start.as_u64(), PAGE_SIZE) >> PAGE_SHIFT)
            ..(align_up(self.end.as_u64(), PAGE_SIZE) >> PAGE_SHIFT)
    }

    /// Frame numbers of the pages lying entirely inside the range.
    ///
    /// Empty when the range does not cover a single whole page.
    #[inline]
    #[must_use]
    pub const fn pages_covered(&self) -> Range<u64> {
        let first = align_up(self.start.as_u64(), PAGE_SIZE) >> PAGE_SHIFT;
        let last = align_down(self.end.as_u64(), PAGE_SIZE) >> PAGE_SHIFT;
        if last < first { first..first } else { first..last }
    }

    /// The overlapping part of two ranges, if any.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Self { start, end })
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA[{:#x}..{:#x})", self.start.as_u64(), self.end.as_u64())
    }
}

/// Half-open virtual byte range `[start, end)`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        let end = if end.as_u64() < start.as_u64() { start } else { end };
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    /// Whether `[addr, addr + len)` lies entirely inside this range.
    #[inline]
    #[must_use]
    pub const fn contains_span(&self, addr: VirtualAddress, len: u64) -> bool {
        match addr.as_u64().checked_add(len) {
            Some(end) => addr.as_u64() >= self.start.as_u64() && end <= self.end.as_u64(),
            None => false,
        }
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA[{:#x}..{:#x})", self.start.as_u64(), self.end.as_u64())
    }
}
