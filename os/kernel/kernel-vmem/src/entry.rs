//! # Page Table Entry
//!
//! A single 64-bit x86-64 paging entry, shared by all four levels.
//!
//! ```text
//! 63  62..59  58..52  51............12  11..9  8  7  6  5  4   3   2  1  0
//! NX  PKEY    avail   frame number      avail  G  PS D  A  PCD PWT US RW P
//! ```
//!
//! | Bit | Field | Meaning |
//! |-----|-------|---------|
//! | 0 | `present` | Entry is valid. Clear entries fault on access. |
//! | 1 | `writable` | Writes permitted. Effective permission is the AND of all levels. |
//! | 2 | `user` | Accessible from CPL3. |
//! | 3 | `write_through` | PWT cache policy bit. |
//! | 4 | `cache_disabled` | PCD; required for MMIO mappings. |
//! | 5 | `accessed` | Set by the CPU on first access. |
//! | 6 | `dirty` | Set by the CPU on first write (leaves only). |
//! | 7 | `huge` | PS; in a PDPTE/PDE the entry maps 1 GiB / 2 MiB directly. |
//! | 8 | `global` | Not flushed on CR3 reload (leaves only). |
//! | 12..51 | frame | Physical frame number of the next table or the mapped page. |
//! | 63 | `no_execute` | Instruction fetches fault. |

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// x86-64 page table entry (PML4E, PDPTE, PDE or PTE).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// PS bit; only meaningful in PDPT and PD entries.
    pub huge: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl PageTableEntry {
    /// An all-zero, non-present entry.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new()
    }

    /// Physical frame referenced by this entry (next table or mapped page).
    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        PhysicalPage::from_number(self.frame())
    }

    #[inline]
    #[must_use]
    pub const fn with_page(self, page: PhysicalPage) -> Self {
        self.with_frame(page.number())
    }

    /// Flags for kernel-only intermediate tables: present and writable.
    ///
    /// The final permission is decided by the leaf, so non-leaf entries
    /// stay permissive.
    #[inline]
    #[must_use]
    pub const fn kernel_table() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Leaf flags for ordinary kernel data: present, writable, global, NX.
    #[inline]
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global(true)
            .with_no_execute(true)
    }

    /// Leaf flags for device registers: like [`kernel_data`](Self::kernel_data),
    /// but uncached.
    #[inline]
    #[must_use]
    pub const fn kernel_mmio() -> Self {
        Self::kernel_data()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn frame_occupies_bits_12_to_51() {
        let page = PhysicalAddress::new(0x000F_FFFF_FFFF_F000).page();
        let e = PageTableEntry::kernel_data().with_page(page);
        assert_eq!(e.into_bits() & 0x000F_FFFF_FFFF_F000, 0x000F_FFFF_FFFF_F000);
        assert_eq!(e.page(), page);
        assert!(e.no_execute());
        assert!(!e.huge());
    }

    #[test]
    fn mmio_is_uncached() {
        let e = PageTableEntry::kernel_mmio();
        assert!(e.cache_disabled());
        assert!(e.write_through());
        assert!(e.present() && e.writable());
    }

    #[test]
    fn empty_is_all_zero() {
        assert!(PageTableEntry::empty().is_empty());
        assert!(!PageTableEntry::kernel_table().is_empty());
    }
}
