//! # Boot Memory Allocator
//!
//! Physical memory allocator for the bring-up phase, before any general
//! allocator exists. Each memory node is tracked by a bitmap stored inside
//! the node itself ([`BootMemNode`]); [`BootMemory`] keeps up to
//! [`MAX_NUMNODES`] of them in a fixed array and drives the lifecycle:
//!
//! ```text
//! Uninitialized ──init_node──► Active ──retire──► Retired
//! ```
//!
//! Once retired, every remaining free frame and the bitmaps themselves have
//! been handed to a [`FrameSink`], and all further calls fail with
//! [`BootMemError::Retired`].

mod node;

pub use node::BootMemNode;

use crate::memory_map::MemoryMap;
use kernel_info::memory::{MAX_DMA_ADDRESS, MAX_DMA32_ADDRESS, MAX_NUMNODES, SMP_CACHE_BYTES};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, PhysicalRange};
use kernel_vmem::PhysMapper;

/// Receives frames released by [`BootMemory::retire`].
pub trait FrameSink {
    /// Take ownership of a free 4 KiB frame.
    fn release_boot_frame(&mut self, page: PhysicalPage);
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    #[inline]
    fn release_boot_frame(&mut self, page: PhysicalPage) {
        (**self).release_boot_frame(page);
    }
}

/// Totals of a retirement.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RetireReport {
    /// Frames that were still free in the bitmaps.
    pub free_pages: u64,
    /// Frames that held the bitmaps.
    pub bitmap_pages: u64,
}

impl RetireReport {
    /// All frames handed over.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.free_pages + self.bitmap_pages
    }
}

impl core::ops::AddAssign for RetireReport {
    fn add_assign(&mut self, rhs: Self) {
        self.free_pages += rhs.free_pages;
        self.bitmap_pages += rhs.bitmap_pages;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootMemError {
    #[error("the node cannot hold its own bitmap")]
    BitmapDoesNotFit,
    #[error("out of boot memory")]
    OutOfMemory,
    #[error("zero-sized request or alignment not a power of two")]
    InvalidRequest,
    #[error("node id exceeds MAX_NUMNODES or is already in use")]
    TooManyNodes,
    #[error("no boot memory node has been initialized")]
    Uninitialized,
    #[error("the boot allocator has been retired")]
    Retired,
}

/// Lifecycle of the boot allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootMemState {
    Uninitialized,
    Active,
    Retired,
}

/// The boot memory allocator: all nodes plus lifecycle.
pub struct BootMemory<'m, M: PhysMapper> {
    mapper: &'m M,
    map: MemoryMap<'m>,
    nodes: [Option<BootMemNode<'m, M>>; MAX_NUMNODES],
    state: BootMemState,
}

impl<'m, M: PhysMapper> BootMemory<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M, map: MemoryMap<'m>) -> Self {
        Self {
            mapper,
            map,
            nodes: [const { None }; MAX_NUMNODES],
            state: BootMemState::Uninitialized,
        }
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> BootMemState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn memory_map(&self) -> MemoryMap<'m> {
        self.map
    }

    /// The node with the given id, if initialized.
    #[must_use]
    pub fn node(&self, node_id: usize) -> Option<&BootMemNode<'m, M>> {
        self.nodes.get(node_id)?.as_ref()
    }

    fn ensure_active(&self) -> Result<(), BootMemError> {
        match self.state {
            BootMemState::Active => Ok(()),
            BootMemState::Uninitialized => Err(BootMemError::Uninitialized),
            BootMemState::Retired => Err(BootMemError::Retired),
        }
    }

    fn active_nodes(&mut self) -> impl Iterator<Item = &mut BootMemNode<'m, M>> {
        self.nodes.iter_mut().flatten()
    }

    /// Create node `node_id` over the whole frames of `region`.
    ///
    /// Returns the byte range of the node's bitmap arena.
    ///
    /// # Errors
    /// - [`BootMemError::Retired`] after [`retire`](Self::retire).
    /// - [`BootMemError::TooManyNodes`] if the id is out of range or taken.
    /// - [`BootMemError::BitmapDoesNotFit`] if the region has no usable run
    ///   large enough for its bitmap.
    pub fn init_node(&mut self, node_id: usize, region: PhysicalRange) -> Result<PhysicalRange, BootMemError> {
        if self.state == BootMemState::Retired {
            return Err(BootMemError::Retired);
        }
        let slot = self
            .nodes
            .get_mut(node_id)
            .filter(|slot| slot.is_none())
            .ok_or(BootMemError::TooManyNodes)?;
        let node = BootMemNode::init(node_id, self.mapper, self.map, region)?;
        let bitmap = node.bitmap_range();
        *slot = Some(node);
        self.state = BootMemState::Active;
        Ok(bitmap)
    }

    /// Single-node setup: node 0 spans all usable RAM of the memory map and
    /// every usable range is marked free.
    ///
    /// Returns the number of free frames.
    ///
    /// # Errors
    /// Those of [`init_node`](Self::init_node); an empty memory map yields
    /// [`BootMemError::BitmapDoesNotFit`].
    pub fn init_from_memory_map(&mut self) -> Result<u64, BootMemError> {
        let span = self.map.usable_span().ok_or(BootMemError::BitmapDoesNotFit)?;
        self.init_node(0, span)?;
        self.register_usable_memory()
    }

    /// Mark every usable range of the memory map free.
    ///
    /// # Errors
    /// [`BootMemError::Uninitialized`] or [`BootMemError::Retired`].
    pub fn register_usable_memory(&mut self) -> Result<u64, BootMemError> {
        let map = self.map;
        let mut freed = 0;
        for usable in map.usable() {
            freed += self.mark_free(usable)?;
        }
        Ok(freed)
    }

    /// Mark the usable frames fully covered by `range` free on every node.
    ///
    /// Returns the number of frames that became free.
    ///
    /// # Errors
    /// [`BootMemError::Uninitialized`] or [`BootMemError::Retired`].
    pub fn mark_free(&mut self, range: PhysicalRange) -> Result<u64, BootMemError> {
        self.ensure_active()?;
        let map = self.map;
        Ok(self.active_nodes().map(|node| node.mark_free(map, range)).sum())
    }

    /// Mark every frame touched by `range` allocated. Idempotent.
    ///
    /// # Errors
    /// [`BootMemError::Uninitialized`] or [`BootMemError::Retired`].
    pub fn reserve(&mut self, range: PhysicalRange) -> Result<(), BootMemError> {
        self.ensure_active()?;
        self.active_nodes().for_each(|node| node.reserve(range));
        Ok(())
    }

    /// Release the frames fully covered by `range`. Frames the memory map
    /// does not report as usable RAM stay allocated.
    ///
    /// # Errors
    /// [`BootMemError::Uninitialized`] or [`BootMemError::Retired`].
    ///
    /// # Panics
    /// On a double free.
    pub fn free(&mut self, range: PhysicalRange) -> Result<(), BootMemError> {
        self.ensure_active()?;
        let map = self.map;
        self.active_nodes().for_each(|node| node.free(map, range));
        Ok(())
    }

    /// Allocate `size` zeroed bytes aligned to `align`, preferably at or
    /// above `goal` and strictly below `limit`.
    ///
    /// If no node can satisfy the request from `goal`, every node is tried
    /// again without a goal.
    ///
    /// # Errors
    /// - [`BootMemError::InvalidRequest`] for `size == 0` or an alignment
    ///   that is not a power of two.
    /// - [`BootMemError::OutOfMemory`] if no node has a fitting run.
    /// - [`BootMemError::Uninitialized`] or [`BootMemError::Retired`].
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
        limit: Option<PhysicalAddress>,
    ) -> Result<PhysicalAddress, BootMemError> {
        self.ensure_active()?;
        if size == 0 || !align.is_power_of_two() {
            return Err(BootMemError::InvalidRequest);
        }

        let goal = goal.filter(|g| g.as_u64() != 0);
        if let Some(addr) = self.active_nodes().find_map(|node| node.alloc(size, align, goal, limit)) {
            log::debug!("bootmem: {size:#x} bytes at {addr}");
            return Ok(addr);
        }
        if goal.is_some()
            && let Some(addr) = self.active_nodes().find_map(|node| node.alloc(size, align, None, limit))
        {
            log::debug!("bootmem: {size:#x} bytes at {addr} (below goal)");
            return Ok(addr);
        }

        log::warn!("bootmem: cannot satisfy {size:#x} bytes aligned to {align:#x}");
        Err(BootMemError::OutOfMemory)
    }

    /// Cache-line aligned bytes, kept above the DMA zone when possible.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_bytes(&mut self, size: u64) -> Result<PhysicalAddress, BootMemError> {
        self.alloc(size, SMP_CACHE_BYTES, Some(PhysicalAddress::new(MAX_DMA_ADDRESS)), None)
    }

    /// Page-aligned bytes, kept above the DMA zone when possible.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_pages(&mut self, size: u64) -> Result<PhysicalAddress, BootMemError> {
        self.alloc(size, PAGE_SIZE, Some(PhysicalAddress::new(MAX_DMA_ADDRESS)), None)
    }

    /// Cache-line aligned bytes below 4 GiB.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_low(&mut self, size: u64) -> Result<PhysicalAddress, BootMemError> {
        self.alloc(size, SMP_CACHE_BYTES, None, Some(PhysicalAddress::new(MAX_DMA32_ADDRESS)))
    }

    /// Page-aligned bytes below 4 GiB.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_low_pages(&mut self, size: u64) -> Result<PhysicalAddress, BootMemError> {
        self.alloc(size, PAGE_SIZE, None, Some(PhysicalAddress::new(MAX_DMA32_ADDRESS)))
    }

    /// Free frames across all nodes; zero once retired.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.nodes.iter().flatten().map(BootMemNode::free_pages).sum()
    }

    /// Hand every free frame and every bitmap frame to `sink` and shut the
    /// allocator down for good.
    ///
    /// # Errors
    /// [`BootMemError::Uninitialized`] or [`BootMemError::Retired`].
    pub fn retire(&mut self, mut sink: impl FrameSink) -> Result<RetireReport, BootMemError> {
        self.ensure_active()?;
        let mut report = RetireReport::default();
        for node in self.nodes.iter_mut().filter_map(Option::take) {
            report += node.retire(&mut sink);
        }
        self.state = BootMemState::Retired;
        log::info!(
            "bootmem retired: {} frames released ({} free, {} bitmap)",
            report.total(),
            report.free_pages,
            report.bitmap_pages
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::{MemoryKind, MemoryMapEntry};
    use kernel_vmem::testing::TestPhys;

    const BASE: u64 = 0x20_0000;

    #[derive(Default)]
    struct Count(u64);

    impl FrameSink for Count {
        fn release_boot_frame(&mut self, _page: PhysicalPage) {
            self.0 += 1;
        }
    }

    fn pa(frame: u64) -> PhysicalAddress {
        PhysicalAddress::new(BASE + frame * PAGE_SIZE)
    }

    #[test]
    fn lifecycle_errors() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 32);
        let map = [MemoryMapEntry::from_range(BASE, BASE + 32 * PAGE_SIZE, MemoryKind::Usable)];
        let mut boot = BootMemory::new(&phys, MemoryMap::new(&map));

        assert_eq!(boot.state(), BootMemState::Uninitialized);
        assert_eq!(boot.alloc(8, 8, None, None), Err(BootMemError::Uninitialized));
        assert_eq!(boot.retire(Count::default()), Err(BootMemError::Uninitialized));

        assert_eq!(boot.init_from_memory_map(), Ok(31));
        assert_eq!(boot.state(), BootMemState::Active);
        assert_eq!(boot.init_node(0, phys.range()).unwrap_err(), BootMemError::TooManyNodes);
        assert_eq!(boot.init_node(MAX_NUMNODES, phys.range()).unwrap_err(), BootMemError::TooManyNodes);

        assert_eq!(boot.alloc(0, 8, None, None), Err(BootMemError::InvalidRequest));
        assert_eq!(boot.alloc(8, 3, None, None), Err(BootMemError::InvalidRequest));
        assert_eq!(boot.alloc(8, 0, None, None), Err(BootMemError::InvalidRequest));

        let mut sink = Count::default();
        let report = boot.retire(&mut sink).unwrap();
        assert_eq!(report, RetireReport { free_pages: 31, bitmap_pages: 1 });
        assert_eq!(sink.0, 32);

        assert_eq!(boot.state(), BootMemState::Retired);
        assert_eq!(boot.free_pages(), 0);
        assert_eq!(boot.alloc(8, 8, None, None), Err(BootMemError::Retired));
        assert_eq!(boot.reserve(phys.range()), Err(BootMemError::Retired));
        assert_eq!(boot.retire(Count::default()), Err(BootMemError::Retired));
        assert_eq!(boot.init_node(1, phys.range()).unwrap_err(), BootMemError::Retired);
    }

    #[test]
    fn allocation_falls_through_nodes_and_goal() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 32);
        let map = [MemoryMapEntry::from_range(BASE, BASE + 32 * PAGE_SIZE, MemoryKind::Usable)];
        let mut boot = BootMemory::new(&phys, MemoryMap::new(&map));
        boot.init_node(0, PhysicalRange::new(pa(0), pa(16))).unwrap();
        boot.init_node(1, PhysicalRange::new(pa(16), pa(32))).unwrap();
        assert_eq!(boot.register_usable_memory(), Ok(30));

        // Each node has 15 free frames; runs never span nodes.
        assert_eq!(boot.alloc(16 * PAGE_SIZE, PAGE_SIZE, None, None), Err(BootMemError::OutOfMemory));
        // The goal only steers the scan of the node it lies in.
        assert_eq!(boot.alloc(15 * PAGE_SIZE, PAGE_SIZE, Some(pa(20)), None), Ok(pa(1)));
        assert_eq!(boot.alloc(PAGE_SIZE, PAGE_SIZE, None, None), Ok(pa(17)));
        assert_eq!(boot.free_pages(), 14);

        // A goal above all memory is ignored.
        assert_eq!(boot.alloc(PAGE_SIZE, PAGE_SIZE, Some(pa(1000)), None), Ok(pa(18)));
    }

    #[test]
    fn wrappers_respect_dma_boundaries() {
        // Four frames on either side of the 16 MiB line.
        let base = MAX_DMA_ADDRESS - 4 * PAGE_SIZE;
        let phys = TestPhys::new(PhysicalAddress::new(base), 8);
        let map = [MemoryMapEntry::from_range(base, base + 8 * PAGE_SIZE, MemoryKind::Usable)];
        let mut boot = BootMemory::new(&phys, MemoryMap::new(&map));
        boot.init_from_memory_map().unwrap();

        let page = boot.alloc_pages(PAGE_SIZE).unwrap();
        assert_eq!(page.as_u64(), MAX_DMA_ADDRESS);

        let bytes = boot.alloc_bytes(10).unwrap();
        assert_eq!(bytes.as_u64(), MAX_DMA_ADDRESS + PAGE_SIZE);
        let next = boot.alloc_bytes(10).unwrap();
        assert_eq!(next, bytes + SMP_CACHE_BYTES);

        let low = boot.alloc_low_pages(PAGE_SIZE).unwrap();
        assert!(low.as_u64() < MAX_DMA32_ADDRESS);
        let low = boot.alloc_low(1).unwrap();
        assert!(low.as_u64() < MAX_DMA32_ADDRESS);
    }
}
