//! # Address Space (x86-64, PML4-rooted)
//!
//! Typed handle on one page-table tree. It offers the operations the early
//! allocators need:
//!
//! - [`AddressSpace::ensure_chain`] allocates and links missing PDPT/PD/PT
//!   tables down to the table that holds the 4 KiB leaf for a VA.
//! - [`AddressSpace::map_4k`] / [`AddressSpace::unmap_4k`] install and remove
//!   a single 4 KiB leaf.
//! - [`AddressSpace::query`] translates a VA (huge pages included).
//! - [`AddressSpace::copy_top_level_entry`] propagates a PML4 entry from a
//!   reference space into another space.
//!
//! ## Design
//!
//! - Non-leaf entries are created with caller-provided flags; the leaf flags
//!   come from the mapping call.
//! - Tables are only ever *read* through shared references (entries are
//!   atomics), so a fault handler may walk a table another CPU is updating.
//! - Intermediate tables are never reclaimed. Once a PML4 entry has been
//!   copied into other spaces, the tables below it are shared.
//!
//! ## Safety
//!
//! - Changing live leaves requires TLB maintenance (`invlpg` or CR3 reload).
//! - The `PhysMapper` must yield writable views of table frames.

use crate::table::{Level, PageTable};
use crate::{FrameAlloc, PageTableEntry, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage, // PML4 frame
    mapper: &'m M,
}

/// Error returned by [`AddressSpace::map_4k`] and [`AddressSpace::ensure_chain`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory allocating a {0:?} table")]
    OutOfMemory(Level),
    #[error("virtual address is already mapped")]
    AlreadyMapped,
    #[error("a huge page covers the virtual address")]
    HugePage,
}

/// Error returned by [`AddressSpace::unmap_4k`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnmapError {
    #[error("virtual address is not mapped")]
    NotMapped,
    #[error("a huge page covers the virtual address")]
    HugePage,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wraps an existing root table.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage) -> Self {
        Self { root, mapper }
    }

    /// Zeroes `root` and wraps it as an empty address space.
    ///
    /// # Safety
    /// `root` must be a free frame exclusively owned by the caller.
    pub unsafe fn new_empty(mapper: &'m M, root: PhysicalPage) -> Self {
        unsafe { mapper.zero_page(root) };
        Self { root, mapper }
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    fn table(&self, page: PhysicalPage) -> &'m PageTable {
        // Safety: every frame reached from the root is a page table.
        unsafe { self.mapper.phys_to_ref::<PageTable>(page.base()) }
    }

    /// Borrow the PML4.
    #[inline]
    pub fn pml4(&self) -> &'m PageTable {
        self.table(self.root)
    }

    /// Walk down to the PT that holds the leaf for `va`, without allocating.
    fn leaf_table(&self, va: VirtualAddress) -> Result<&'m PageTable, UnmapError> {
        let mut table = self.pml4();
        let mut level = Level::Pml4;
        while let Some(next) = level.next() {
            let e = table.get(level.index_of(va));
            if !e.present() {
                return Err(UnmapError::NotMapped);
            }
            if e.huge() {
                return Err(UnmapError::HugePage);
            }
            table = self.table(e.page());
            level = next;
        }
        Ok(table)
    }

    /// Number of intermediate tables [`ensure_chain`](Self::ensure_chain)
    /// would have to allocate for `va`.
    ///
    /// At most three (PDPT, PD and PT).
    #[must_use]
    pub fn missing_tables(&self, va: VirtualAddress) -> usize {
        let mut table = self.pml4();
        let mut level = Level::Pml4;
        let mut missing = 0;
        while let Some(next) = level.next() {
            let e = table.get(level.index_of(va));
            if !e.present() || e.huge() {
                missing += 1;
                // Everything below a missing entry is missing as well.
                let mut below = next;
                while let Some(n) = below.next() {
                    missing += 1;
                    below = n;
                }
                return missing;
            }
            table = self.table(e.page());
            level = next;
        }
        missing
    }

    /// Ensure the PDPT/PD/PT chain for `va` exists, allocating zeroed tables
    /// from `alloc` and linking them with `nonleaf` flags.
    ///
    /// Returns the PT frame that holds the leaf for `va`.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if `alloc` runs dry; tables linked before
    ///   the failure stay in place.
    /// - [`MapError::HugePage`] if a 1 GiB or 2 MiB leaf covers `va`.
    pub fn ensure_chain<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        nonleaf: PageTableEntry,
    ) -> Result<PhysicalPage, MapError> {
        let mut page = self.root;
        let mut level = Level::Pml4;
        while let Some(next) = level.next() {
            let table = self.table(page);
            let idx = level.index_of(va);
            let e = table.get(idx);
            page = if e.present() {
                if e.huge() {
                    return Err(MapError::HugePage);
                }
                e.page()
            } else {
                let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory(next))?;
                // Safety: the allocator hands out unused frames.
                unsafe { self.mapper.zero_page(frame) };
                table.set(idx, nonleaf.with_present(true).with_huge(false).with_page(frame));
                log::trace!("linked new {next:?} table {frame} for {va}");
                frame
            };
            level = next;
        }
        Ok(page)
    }

    /// Map one 4 KiB page `va → pa`.
    ///
    /// # Errors
    /// - Any error of [`ensure_chain`](Self::ensure_chain).
    /// - [`MapError::AlreadyMapped`] if a leaf for `va` already exists.
    pub fn map_4k<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalPage,
        nonleaf: PageTableEntry,
        leaf: PageTableEntry,
    ) -> Result<(), MapError> {
        debug_assert!(va.is_page_aligned());
        let pt = self.table(self.ensure_chain(alloc, va, nonleaf)?);
        let idx = Level::Pt.index_of(va);
        if pt.get(idx).present() {
            return Err(MapError::AlreadyMapped);
        }
        pt.set(idx, leaf.with_present(true).with_huge(false).with_page(pa));
        Ok(())
    }

    /// Remove the 4 KiB leaf for `va` and return the frame it mapped.
    ///
    /// Intermediate tables are left in place.
    ///
    /// # Errors
    /// - [`UnmapError::NotMapped`] if no leaf exists.
    /// - [`UnmapError::HugePage`] if a huge page covers `va`.
    pub fn unmap_4k(&self, va: VirtualAddress) -> Result<PhysicalPage, UnmapError> {
        let pt = self.leaf_table(va)?;
        let idx = Level::Pt.index_of(va);
        let e = pt.get(idx);
        if !e.present() {
            return Err(UnmapError::NotMapped);
        }
        pt.clear(idx);
        Ok(e.page())
    }

    /// Leaf entry for `va`, if a 4 KiB mapping exists.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let e = self.leaf_table(va).ok()?.get(Level::Pt.index_of(va));
        e.present().then_some(e)
    }

    /// Translate `va` to its physical address.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.pml4();
        let mut level = Level::Pml4;
        loop {
            let e = table.get(level.index_of(va));
            if !e.present() {
                return None;
            }
            let next = match level.next() {
                Some(next) if !e.huge() => next,
                _ => {
                    let offset = va.as_u64() & (level.entry_span() - 1);
                    return Some(e.page().base() + offset);
                }
            };
            table = self.table(e.page());
            level = next;
        }
    }

    /// PML4 entry covering `va`.
    #[inline]
    #[must_use]
    pub fn top_level_entry(&self, va: VirtualAddress) -> PageTableEntry {
        self.pml4().get(Level::Pml4.index_of(va))
    }

    /// Copy the PML4 entry covering `va` from `reference` into this space.
    ///
    /// Only fills an empty slot; returns `true` if this call installed the
    /// entry. Idempotent and safe against concurrent callers.
    pub fn copy_top_level_entry(&self, reference: &AddressSpace<'_, M>, va: VirtualAddress) -> bool {
        let e = reference.top_level_entry(va);
        if !e.present() {
            return false;
        }
        self.pml4().set_if_empty(Level::Pml4.index_of(va), e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpFrameAlloc, TestPhys};

    const PHYS_BASE: u64 = 0x0040_0000;

    fn setup(frames: usize) -> (TestPhys, BumpFrameAlloc) {
        let phys = TestPhys::new(PhysicalAddress::new(PHYS_BASE), frames);
        let alloc = BumpFrameAlloc::new(phys.range());
        (phys, alloc)
    }

    #[test]
    fn map_4k_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(16);
        let root = alloc.alloc_4k().unwrap();
        let aspace = unsafe { AddressSpace::new_empty(&phys, root) };

        let va = VirtualAddress::new(0xFFFF_C900_0000_3000);
        let pa = PhysicalAddress::new(PHYS_BASE + 0xF000).page();
        assert_eq!(aspace.missing_tables(va), 3);

        aspace
            .map_4k(&mut alloc, va, pa, PageTableEntry::kernel_table(), PageTableEntry::kernel_data())
            .expect("map_4k");

        // root + PDPT + PD + PT
        assert_eq!(alloc.allocated(), 4);
        assert_eq!(aspace.missing_tables(va), 0);
        assert_eq!(aspace.query(va + 0x123), Some(pa.base() + 0x123));
        let leaf = aspace.leaf_entry(va).unwrap();
        assert!(leaf.global() && leaf.no_execute() && leaf.writable());

        // A neighbouring page reuses the whole chain.
        let va2 = va + 0x1000;
        aspace
            .map_4k(&mut alloc, va2, pa, PageTableEntry::kernel_table(), PageTableEntry::kernel_data())
            .unwrap();
        assert_eq!(alloc.allocated(), 4);
    }

    #[test]
    fn map_twice_is_rejected() {
        let (phys, mut alloc) = setup(16);
        let root = alloc.alloc_4k().unwrap();
        let aspace = unsafe { AddressSpace::new_empty(&phys, root) };
        let va = VirtualAddress::new(0xFFFF_C900_0000_0000);
        let pa = PhysicalPage::from_number(0x500);
        let nl = PageTableEntry::kernel_table();
        let leaf = PageTableEntry::kernel_data();

        aspace.map_4k(&mut alloc, va, pa, nl, leaf).unwrap();
        assert_eq!(aspace.map_4k(&mut alloc, va, pa, nl, leaf), Err(MapError::AlreadyMapped));
    }

    #[test]
    fn ensure_chain_reports_oom() {
        let (phys, mut alloc) = setup(2);
        let root = alloc.alloc_4k().unwrap();
        let aspace = unsafe { AddressSpace::new_empty(&phys, root) };
        let va = VirtualAddress::new(0xFFFF_C900_0000_0000);
        assert_eq!(
            aspace.ensure_chain(&mut alloc, va, PageTableEntry::kernel_table()),
            Err(MapError::OutOfMemory(Level::Pd))
        );
    }

    #[test]
    fn unmap_returns_frame_and_keeps_tables() {
        let (phys, mut alloc) = setup(16);
        let root = alloc.alloc_4k().unwrap();
        let aspace = unsafe { AddressSpace::new_empty(&phys, root) };
        let va = VirtualAddress::new(0xFFFF_C900_0010_0000);
        let pa = PhysicalPage::from_number(0x777);

        assert_eq!(aspace.unmap_4k(va), Err(UnmapError::NotMapped));
        aspace
            .map_4k(&mut alloc, va, pa, PageTableEntry::kernel_table(), PageTableEntry::kernel_data())
            .unwrap();
        assert_eq!(aspace.unmap_4k(va), Ok(pa));
        assert_eq!(aspace.query(va), None);
        assert_eq!(aspace.unmap_4k(va), Err(UnmapError::NotMapped));
        assert_eq!(aspace.missing_tables(va), 0);
    }

    #[test]
    fn huge_pages_translate_but_block_4k_maps() {
        let (phys, mut alloc) = setup(16);
        let root = alloc.alloc_4k().unwrap();
        let aspace = unsafe { AddressSpace::new_empty(&phys, root) };
        let va = VirtualAddress::new(0xFFFF_8880_0000_0000);

        // Install a 1 GiB leaf by hand: PML4 → PDPT(PS=1).
        let pdpt = aspace.ensure_chain(&mut alloc, va, PageTableEntry::kernel_table());
        assert!(pdpt.is_ok());
        let pml4e = aspace.top_level_entry(va);
        let pdpt_table = unsafe { phys.phys_to_ref::<PageTable>(pml4e.page().base()) };
        pdpt_table.set(
            Level::Pdpt.index_of(va),
            PageTableEntry::kernel_data().with_huge(true).with_page(PhysicalPage::from_number(0)),
        );

        assert_eq!(aspace.query(va + 0x1234_5678), Some(PhysicalAddress::new(0x1234_5678)));
        assert_eq!(
            aspace.map_4k(
                &mut alloc,
                va,
                PhysicalPage::from_number(1),
                PageTableEntry::kernel_table(),
                PageTableEntry::kernel_data()
            ),
            Err(MapError::HugePage)
        );
        assert_eq!(aspace.unmap_4k(va), Err(UnmapError::HugePage));
    }

    #[test]
    fn copy_top_level_entry_is_idempotent() {
        let (phys, mut alloc) = setup(16);
        let reference = unsafe { AddressSpace::new_empty(&phys, alloc.alloc_4k().unwrap()) };
        let ctx = unsafe { AddressSpace::new_empty(&phys, alloc.alloc_4k().unwrap()) };
        let va = VirtualAddress::new(0xFFFF_C900_0000_5000);

        assert!(!ctx.copy_top_level_entry(&reference, va));

        let pa = PhysicalPage::from_number(0x900);
        reference
            .map_4k(&mut alloc, va, pa, PageTableEntry::kernel_table(), PageTableEntry::kernel_data())
            .unwrap();
        assert_eq!(ctx.query(va), None);

        assert!(ctx.copy_top_level_entry(&reference, va));
        assert!(!ctx.copy_top_level_entry(&reference, va));
        assert_eq!(ctx.query(va), Some(pa.base()));
        assert_eq!(ctx.top_level_entry(va), reference.top_level_entry(va));
    }
}
