//! Region descriptors and first-fit placement.

use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualRange};

/// What a region's pages are backed by.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionPurpose {
    /// Fresh pages from the page allocator, owned by the region.
    General,
    /// Device memory starting at `phys` (page aligned), mapped uncached and
    /// never released to the page allocator.
    IoRemap { phys: PhysicalAddress },
}

/// Public summary of a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Page-aligned start of the mapped range.
    pub base: VirtualAddress,
    /// Mapped bytes, a multiple of the page size. The trailing guard page
    /// is not included.
    pub size: u64,
    pub purpose: RegionPurpose,
}

impl RegionInfo {
    #[inline]
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        VirtualRange::new(self.base, VirtualAddress::new(self.base.as_u64() + self.size))
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.size / PAGE_SIZE
    }
}

/// A reserved virtual range `[base, base + size)` followed by one unmapped
/// guard page.
#[derive(Debug)]
pub(crate) struct VmRegion {
    pub base: VirtualAddress,
    pub size: u64,
    pub purpose: RegionPurpose,
    /// Backing frames of a [`RegionPurpose::General`] region.
    pub frames: Vec<PhysicalPage>,
    /// `false` while the region is still being populated; such regions
    /// reserve their range but cannot be found or freed.
    pub ready: bool,
}

impl VmRegion {
    pub const fn new(base: VirtualAddress, size: u64, purpose: RegionPurpose) -> Self {
        Self {
            base,
            size,
            purpose,
            frames: Vec::new(),
            ready: false,
        }
    }

    #[inline]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    /// First byte past the guard page.
    #[inline]
    pub const fn guarded_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size + PAGE_SIZE)
    }

    /// Whether `addr` lies in the mapped part.
    #[inline]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    #[inline]
    pub const fn info(&self) -> RegionInfo {
        RegionInfo {
            base: self.base,
            size: self.size,
            purpose: self.purpose,
        }
    }
}

/// First gap in `window` that holds `size` bytes plus a guard page.
///
/// `regions` must be sorted by address. Returns the insertion index that
/// keeps the order, together with the base of the gap.
pub(crate) fn find_gap(regions: &[VmRegion], window: VirtualRange, size: u64) -> Option<(usize, VirtualAddress)> {
    let needed = size.checked_add(PAGE_SIZE)?;
    let mut addr = window.start();
    for (i, region) in regions.iter().enumerate() {
        if addr.checked_add(needed)? <= region.base {
            return Some((i, addr));
        }
        addr = region.guarded_end();
    }
    (addr.checked_add(needed)? <= window.end()).then_some((regions.len(), addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = 0xFFFF_C900_0000_0000;

    fn window(pages: u64) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(START), VirtualAddress::new(START + pages * PAGE_SIZE))
    }

    fn region(page: u64, pages: u64) -> VmRegion {
        VmRegion::new(VirtualAddress::new(START + page * PAGE_SIZE), pages * PAGE_SIZE, RegionPurpose::General)
    }

    fn va(page: u64) -> VirtualAddress {
        VirtualAddress::new(START + page * PAGE_SIZE)
    }

    #[test]
    fn empty_window_places_at_start() {
        assert_eq!(find_gap(&[], window(8), 7 * PAGE_SIZE), Some((0, va(0))));
        // Seven pages plus the guard exceed a window of seven.
        assert_eq!(find_gap(&[], window(7), 7 * PAGE_SIZE), None);
    }

    #[test]
    fn gaps_account_for_guard_pages() {
        // [0..2) guard 2, [5..6) guard 6
        let regions = [region(0, 2), region(5, 1)];
        // Gap between is pages 3..5: two pages, fits one page + guard.
        assert_eq!(find_gap(&regions, window(16), PAGE_SIZE), Some((1, va(3))));
        // Two pages need three; only after the last guard.
        assert_eq!(find_gap(&regions, window(16), 2 * PAGE_SIZE), Some((2, va(7))));
        assert_eq!(find_gap(&regions, window(9), 2 * PAGE_SIZE), None);
    }

    #[test]
    fn gap_before_first_region() {
        let regions = [region(4, 1)];
        assert_eq!(find_gap(&regions, window(16), 3 * PAGE_SIZE), Some((0, va(0))));
        assert_eq!(find_gap(&regions, window(16), 4 * PAGE_SIZE), Some((1, va(6))));
    }

    #[test]
    fn region_bounds() {
        let r = region(2, 3);
        assert!(r.contains(va(2)));
        assert!(r.contains(VirtualAddress::new(va(5).as_u64() - 1)));
        assert!(!r.contains(va(5)));
        assert_eq!(r.guarded_end(), va(6));
        assert_eq!(r.info().pages(), 3);
        assert_eq!(r.info().range().end(), va(5));
    }
}
