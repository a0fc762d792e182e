//! # Firmware Memory Map
//!
//! A borrowed, typed view of the physical memory map handed over by the
//! loader. The boot allocator consults it to place its bitmap and to keep
//! holes (firmware, MMIO, unbacked addresses) marked allocated.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalRange};

/// What a physical memory range may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryKind {
    /// General-purpose RAM.
    Usable,
    /// Firmware-reserved; never touched.
    Reserved,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Memory-mapped device registers.
    Mmio,
    /// Defective RAM.
    Unusable,
}

impl MemoryKind {
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One memory-map descriptor covering `page_count` 4 KiB pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub start: PhysicalAddress,
    pub page_count: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, page_count: u64, kind: MemoryKind) -> Self {
        Self {
            start,
            page_count,
            kind,
        }
    }

    /// Convenience constructor for `[start, end)` in bytes; the end is
    /// rounded up to a whole page.
    #[inline]
    #[must_use]
    pub const fn from_range(start: u64, end: u64, kind: MemoryKind) -> Self {
        Self::new(
            PhysicalAddress::new(start),
            (end - start).div_ceil(PAGE_SIZE),
            kind,
        )
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::from_start_len(self.start, self.page_count * PAGE_SIZE)
    }
}

/// The firmware memory map. Entries may come in any order.
#[derive(Copy, Clone, Debug)]
pub struct MemoryMap<'a> {
    entries: &'a [MemoryMapEntry],
}

impl<'a> MemoryMap<'a> {
    #[inline]
    #[must_use]
    pub const fn new(entries: &'a [MemoryMapEntry]) -> Self {
        Self { entries }
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &'a [MemoryMapEntry] {
        self.entries
    }

    /// Byte ranges of usable RAM, in map order.
    pub fn usable(self) -> impl Iterator<Item = PhysicalRange> + 'a {
        self.entries
            .iter()
            .filter(|e| e.kind.is_usable())
            .map(MemoryMapEntry::range)
            .filter(|r| !r.is_empty())
    }

    /// The parts of `range` that are backed by usable RAM.
    pub fn usable_within(self, range: PhysicalRange) -> impl Iterator<Item = PhysicalRange> + 'a {
        self.usable().filter_map(move |r| r.intersect(&range))
    }

    /// Whether every byte of `range` is usable RAM.
    ///
    /// The range may span several adjacent usable entries.
    #[must_use]
    pub fn is_usable(&self, range: PhysicalRange) -> bool {
        let mut cursor = range.start();
        while cursor < range.end() {
            match self.usable().find(|r| r.contains(cursor)) {
                Some(r) => cursor = r.end(),
                None => return false,
            }
        }
        true
    }

    /// Smallest range enclosing all usable RAM, if any.
    #[must_use]
    pub fn usable_span(&self) -> Option<PhysicalRange> {
        let start = self.usable().map(|r| r.start()).min()?;
        let end = self.usable().map(|r| r.end()).max()?;
        Some(PhysicalRange::new(start, end))
    }

    /// Total number of whole usable pages.
    #[must_use]
    pub fn usable_pages(&self) -> u64 {
        self.usable()
            .map(|r| {
                let pages = r.pages_covered();
                pages.end - pages.start
            })
            .sum()
    }
}
