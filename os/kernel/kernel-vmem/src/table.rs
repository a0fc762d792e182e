//! # Page Tables
//!
//! A [`PageTable`] is one 4 KiB frame holding 512 entries. The same layout
//! is used at every level; [`Level`] says how a virtual address indexes it.
//!
//! Entries are stored as [`AtomicU64`] so that a table can be read by one
//! CPU while another updates it. Writers are serialized externally; readers
//! see either the old or the new entry.

use crate::PageTableEntry;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in every table.
pub const ENTRIES: usize = 512;

/// Paging level, from the root down.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// Level 4, indexed by VA bits `[47:39]`.
    Pml4,
    /// Level 3, indexed by VA bits `[38:30]`.
    Pdpt,
    /// Level 2, indexed by VA bits `[29:21]`.
    Pd,
    /// Level 1, indexed by VA bits `[20:12]`.
    Pt,
}

impl Level {
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below this one, or `None` for [`Level::Pt`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }
}

/// Index into a [`PageTable`], always in `0..512`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 512`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A 4 KiB-aligned table of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub fn get(&self, i: TableIndex) -> PageTableEntry {
        PageTableEntry::from_bits(self.entries[i.as_usize()].load(Ordering::Acquire))
    }

    /// Overwrites the entry at `i`.
    ///
    /// Changing a live leaf requires TLB maintenance by the caller.
    #[inline]
    pub fn set(&self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()].store(e.into_bits(), Ordering::Release);
    }

    /// Installs `e` only if slot `i` is currently empty.
    ///
    /// Returns `true` if this call stored the entry. Concurrent callers
    /// racing to install the same entry all leave the table consistent.
    #[inline]
    pub fn set_if_empty(&self, i: TableIndex, e: PageTableEntry) -> bool {
        self.entries[i.as_usize()]
            .compare_exchange(0, e.into_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn clear(&self, i: TableIndex) {
        self.set(i, PageTableEntry::empty());
    }

    /// Iterates over `(index, entry)` for every present entry.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        (0..ENTRIES).filter_map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            let e = self.get(idx);
            e.present().then_some((idx, e))
        })
    }
}
