//! # Virtual Region Allocator
//!
//! Presents physically scattered pages as contiguous kernel virtual ranges
//! (`vmalloc`) and maps device memory uncached (`ioremap`). All regions live
//! in one window of the kernel address space:
//!
//! ```text
//! VMALLOC_START                                                 VMALLOC_END
//! | region A |g| region B    |g|      free      | region C |g|     free    |
//! ```
//!
//! Every region is followed by one unmapped guard page (`g`), so an overrun
//! faults instead of silently corrupting the neighbour.
//!
//! Mappings are installed in a **reference page table** only. Other address
//! spaces share the window through copies of its top-level entries, which
//! they pick up lazily on their first fault in the window
//! ([`KernelAddressSpace::handle_fault`]) or eagerly with
//! [`KernelAddressSpace::populate_context`]. Intermediate tables are never
//! freed, so a copied entry stays valid forever. The default window spans
//! whole top-level entries; a smaller window may share its first and last
//! slot with other kernel memory, which is only copied where the context
//! has no entry of its own.
//!
//! ## Locking
//! One [`SpinLock`] protects the region list and every mutation of the
//! reference table. The page allocator is never called with it held: pages
//! and page-table frames are obtained first, then the lock is taken just
//! long enough to install one mapping.

pub mod fault;
mod region;
mod reserve;

pub use fault::{FaultError, FaultResolution, PageFaultErrorCode};
pub use region::{RegionInfo, RegionPurpose};

use crate::page_list::PageAllocator;
use alloc::vec::Vec;
use kernel_info::memory::{VMALLOC_END, VMALLOC_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualRange};
use kernel_sync::SpinLock;
use kernel_vmem::table::Level;
use kernel_vmem::{AddressSpace, MapError, PageTableEntry, PhysMapper, UnmapError};
use region::{VmRegion, find_gap};
use reserve::TableReserve;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmallocError {
    #[error("no gap in the vmalloc window is large enough")]
    OutOfVirtualSpace,
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("no region contains the address")]
    NotFound,
    #[error("zero-sized or oversized request")]
    InvalidSize,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// The kernel's view of the vmalloc window: reference page table, region
/// list and the page allocator backing both.
pub struct KernelAddressSpace<'m, M: PhysMapper, P: PageAllocator> {
    reference: AddressSpace<'m, M>,
    window: VirtualRange,
    pages: P,
    regions: SpinLock<Vec<VmRegion>>,
}

impl<'m, M: PhysMapper, P: PageAllocator> KernelAddressSpace<'m, M, P> {
    /// Manage `window` on top of an existing reference table.
    ///
    /// # Panics
    /// If the window is not page aligned.
    pub fn with_reference(reference: AddressSpace<'m, M>, window: VirtualRange, pages: P) -> Self {
        assert!(window.start().is_page_aligned() && window.end().is_page_aligned());
        Self {
            reference,
            window,
            pages,
            regions: SpinLock::new(Vec::new()),
        }
    }

    /// Manage `window` with a fresh, empty reference table taken from `pages`.
    ///
    /// # Errors
    /// [`VmallocError::OutOfMemory`] if no frame is left for the root table.
    ///
    /// # Panics
    /// If the window is not page aligned.
    pub fn new(mapper: &'m M, window: VirtualRange, pages: P) -> Result<Self, VmallocError> {
        let root = pages.alloc_page().ok_or(VmallocError::OutOfMemory)?;
        // Safety: the frame was just handed out by the page allocator.
        let reference = unsafe { AddressSpace::new_empty(mapper, root) };
        log::info!("vmalloc: reference table at {root}, window {window:?}");
        Ok(Self::with_reference(reference, window, pages))
    }

    /// [`new`](Self::new) over `VMALLOC_START..VMALLOC_END`.
    ///
    /// # Errors
    /// As [`new`](Self::new).
    pub fn with_default_window(mapper: &'m M, pages: P) -> Result<Self, VmallocError> {
        let window = VirtualRange::new(VirtualAddress::new(VMALLOC_START), VirtualAddress::new(VMALLOC_END));
        Self::new(mapper, window, pages)
    }

    #[inline]
    pub const fn window(&self) -> VirtualRange {
        self.window
    }

    /// The reference page table.
    #[inline]
    pub const fn reference(&self) -> &AddressSpace<'m, M> {
        &self.reference
    }

    #[inline]
    pub const fn page_allocator(&self) -> &P {
        &self.pages
    }

    /// Reserve a guarded range of `size` bytes (rounded up to whole pages)
    /// and map it in the reference table.
    ///
    /// On failure everything installed so far is torn down and the range is
    /// released again.
    ///
    /// # Errors
    /// - [`VmallocError::InvalidSize`] for `size == 0`.
    /// - [`VmallocError::OutOfVirtualSpace`] if no gap fits.
    /// - [`VmallocError::OutOfMemory`] if backing pages or page-table frames
    ///   run out.
    /// - [`VmallocError::Map`] if the reference table disagrees with the
    ///   region list (an existing mapping in a free gap).
    pub fn allocate_region(&self, size: u64, purpose: RegionPurpose) -> Result<RegionInfo, VmallocError> {
        if size == 0 {
            return Err(VmallocError::InvalidSize);
        }
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(VmallocError::InvalidSize)?;
        if let RegionPurpose::IoRemap { phys } = purpose {
            debug_assert!(phys.is_page_aligned());
        }

        let base = self
            .regions
            .with_lock(|regions| {
                let (index, base) = find_gap(regions, self.window, size)?;
                regions.insert(index, VmRegion::new(base, size, purpose));
                Some(base)
            })
            .ok_or_else(|| {
                log::warn!("vmalloc: no room for {size:#x} bytes");
                VmallocError::OutOfVirtualSpace
            })?;

        let mut frames = Vec::new();
        if purpose == RegionPurpose::General {
            frames.reserve_exact(pages_in(size));
        }
        if let Err(e) = self.populate(base, size, purpose, &mut frames) {
            self.rollback(base, size, frames);
            return Err(e);
        }

        self.regions.with_lock(|regions| {
            if let Some(region) = regions.iter_mut().find(|r| r.base == base) {
                region.frames = frames;
                region.ready = true;
            }
        });
        log::debug!("vmalloc: {size:#x} bytes at {base} ({purpose:?})");
        Ok(RegionInfo { base, size, purpose })
    }

    fn populate(
        &self,
        base: VirtualAddress,
        size: u64,
        purpose: RegionPurpose,
        frames: &mut Vec<PhysicalPage>,
    ) -> Result<(), VmallocError> {
        let mut reserve = TableReserve::new();
        let result = (0..size / PAGE_SIZE).try_for_each(|i| {
            let va = base + i * PAGE_SIZE;
            let (frame, leaf) = match purpose {
                RegionPurpose::General => {
                    let frame = self.pages.alloc_page().ok_or(VmallocError::OutOfMemory)?;
                    frames.push(frame);
                    (frame, PageTableEntry::kernel_data())
                }
                RegionPurpose::IoRemap { phys } => ((phys + i * PAGE_SIZE).page(), PageTableEntry::kernel_mmio()),
            };

            if !reserve.fill(&self.pages, self.reference.missing_tables(va)) {
                return Err(VmallocError::OutOfMemory);
            }
            self.regions
                .with_lock(|_| {
                    self.reference
                        .map_4k(&mut reserve, va, frame, PageTableEntry::kernel_table(), leaf)
                })
                .map_err(|e| match e {
                    MapError::OutOfMemory(_) => VmallocError::OutOfMemory,
                    other => other.into(),
                })?;
            log::trace!("vmalloc: {va} -> {frame}");
            Ok(())
        });
        reserve.release(&self.pages);
        result
    }

    /// Undo a partially populated region.
    fn rollback(&self, base: VirtualAddress, size: u64, frames: Vec<PhysicalPage>) {
        self.regions.with_lock(|regions| {
            for i in 0..size / PAGE_SIZE {
                let va = base + i * PAGE_SIZE;
                match self.reference.unmap_4k(va) {
                    // Slots past the failure point were never mapped.
                    Ok(_) | Err(UnmapError::NotMapped) => {}
                    Err(e) => log::error!("vmalloc: rollback of {va} failed: {e}"),
                }
            }
            regions.retain(|r| r.base != base);
        });
        for &frame in &frames {
            self.pages.free_page(frame);
        }
        log::warn!("vmalloc: rolled back {size:#x} bytes at {base}, {} pages returned", frames.len());
    }

    /// Release the region containing `addr`.
    ///
    /// Leaves are removed under the lock; owned frames go back to the page
    /// allocator afterwards. Page tables stay.
    ///
    /// # Errors
    /// [`VmallocError::NotFound`] if no fully set-up region contains `addr`
    /// (guard pages included).
    pub fn free_region(&self, addr: VirtualAddress) -> Result<RegionInfo, VmallocError> {
        let region = self
            .regions
            .with_lock(|regions| {
                let index = regions.iter().position(|r| r.ready && r.contains(addr))?;
                let region = regions.remove(index);
                for i in 0..region.size / PAGE_SIZE {
                    let va = region.base + i * PAGE_SIZE;
                    if let Err(e) = self.reference.unmap_4k(va) {
                        log::error!("vmalloc: {va} of region {} was not mapped: {e}", region.base);
                    }
                }
                Some(region)
            })
            .ok_or(VmallocError::NotFound)?;

        for &frame in &region.frames {
            self.pages.free_page(frame);
        }
        log::debug!("vmalloc: freed {:#x} bytes at {}", region.size, region.base);
        Ok(region.info())
    }

    /// Virtually contiguous, page-granular kernel memory.
    ///
    /// # Errors
    /// As [`allocate_region`](Self::allocate_region).
    pub fn vmalloc(&self, size: u64) -> Result<VirtualAddress, VmallocError> {
        self.allocate_region(size, RegionPurpose::General).map(|r| r.base)
    }

    /// Release memory obtained from [`vmalloc`](Self::vmalloc).
    ///
    /// # Errors
    /// As [`free_region`](Self::free_region).
    pub fn vfree(&self, addr: VirtualAddress) -> Result<(), VmallocError> {
        self.free_region(addr).map(drop)
    }

    /// Map `size` bytes of device memory at `phys` uncached.
    ///
    /// `phys` need not be page aligned; the returned address carries the
    /// same offset into its page.
    ///
    /// # Errors
    /// As [`allocate_region`](Self::allocate_region).
    pub fn ioremap(&self, phys: PhysicalAddress, size: u64) -> Result<VirtualAddress, VmallocError> {
        if size == 0 {
            return Err(VmallocError::InvalidSize);
        }
        let offset = phys.page_offset();
        let span = size.checked_add(offset).ok_or(VmallocError::InvalidSize)?;
        let region = self.allocate_region(
            span,
            RegionPurpose::IoRemap {
                phys: phys.align_down(PAGE_SIZE),
            },
        )?;
        Ok(region.base + offset)
    }

    /// Unmap a range obtained from [`ioremap`](Self::ioremap).
    ///
    /// # Errors
    /// As [`free_region`](Self::free_region).
    pub fn iounmap(&self, addr: VirtualAddress) -> Result<(), VmallocError> {
        self.free_region(addr).map(drop)
    }

    /// The region whose mapped part contains `addr`.
    pub fn find_region(&self, addr: VirtualAddress) -> Option<RegionInfo> {
        self.regions.with_lock(|regions| {
            regions
                .iter()
                .find(|r| r.ready && r.contains(addr))
                .map(VmRegion::info)
        })
    }

    /// Physical address behind `addr` according to the reference table.
    pub fn translate(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.window.contains(addr) {
            return None;
        }
        self.reference.query(addr)
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.regions.with_lock(|regions| regions.iter().filter(|r| r.ready).count())
    }

    /// Snapshot of all live regions in address order.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions.with_lock(|regions| {
            regions
                .iter()
                .filter(|r| r.ready)
                .map(VmRegion::info)
                .collect()
        })
    }

    /// Copy every present top-level entry overlapping the window into `ctx`.
    ///
    /// Returns the number of entries installed.
    pub fn populate_context(&self, ctx: &AddressSpace<'_, M>) -> usize {
        let span = Level::Pml4.entry_span();
        let mut installed = 0;
        let mut va = self.window.start().align_down(span);
        while va < self.window.end() {
            if ctx.copy_top_level_entry(&self.reference, va) {
                installed += 1;
            }
            match va.checked_add(span) {
                Some(next) => va = next,
                None => break,
            }
        }
        log::debug!("vmalloc: {installed} top-level entries copied into {}", ctx.root_page());
        installed
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn pages_in(size: u64) -> usize {
    (size / PAGE_SIZE) as usize
}
