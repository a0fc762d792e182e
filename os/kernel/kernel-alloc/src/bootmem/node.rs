//! # Per-node boot bitmap
//!
//! One bit per page frame of the node: `1` = allocated, reserved or hole,
//! `0` = free. The bitmap lives inside the node it describes, in an arena
//! placed by hand during [`BootMemNode::init`]:
//!
//! ```text
//! start_pfn                                                     end_pfn
//! |  hole  | bitmap arena |  usable RAM  | firmware |  usable RAM  |
//! |  1111  |     1111     |  0000..0000  |   1111   |  0000..0000  |
//! ```
//!
//! Allocations are first-fit from a preferred frame and may share the
//! partially used tail page of the previous allocation.

use crate::bootmem::{FrameSink, RetireReport};
use crate::memory_map::MemoryMap;
use bitvec::prelude::*;
use core::ops::Range;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, PhysicalRange, align_up, pages_for,
};
use kernel_vmem::PhysMapper;

/// Boot allocator state of one memory node.
pub struct BootMemNode<'m, M: PhysMapper> {
    node_id: usize,
    mapper: &'m M,
    /// First frame of the node.
    start_pfn: u64,
    /// One past the last frame of the node.
    end_pfn: u64,
    /// First byte of the bitmap arena; always page aligned.
    bitmap: PhysicalAddress,
    bitmap_pages: u64,
    /// Frame holding the tail of the most recent allocation.
    last_alloc_frame: u64,
    /// Bytes used in `last_alloc_frame`; `0` means the frame is fully consumed.
    last_alloc_offset: u64,
}

impl<'m, M: PhysMapper> BootMemNode<'m, M> {
    /// Set up a node covering the whole frames of `region`.
    ///
    /// The bitmap (`ceil(frames / 8)` bytes) goes to the lowest page-aligned
    /// address of the node whose whole arena is usable RAM. Every bit starts
    /// out allocated; free memory has to be announced with
    /// [`mark_free`](Self::mark_free).
    ///
    /// # Errors
    /// [`BootMemError::BitmapDoesNotFit`](super::BootMemError::BitmapDoesNotFit)
    /// if no usable run inside the node can hold the bitmap.
    pub fn init(
        node_id: usize,
        mapper: &'m M,
        map: MemoryMap<'_>,
        region: PhysicalRange,
    ) -> Result<Self, super::BootMemError> {
        let frames = region.pages_covered();
        let pages = frames.end - frames.start;
        if pages == 0 {
            return Err(super::BootMemError::BitmapDoesNotFit);
        }

        let bitmap_pages = pages_for(pages.div_ceil(8));
        let span = PhysicalRange::new(
            PhysicalPage::from_number(frames.start).base(),
            PhysicalPage::from_number(frames.end).base(),
        );
        let bitmap = map
            .usable_within(span)
            .filter_map(|usable| {
                let candidate = usable.start().align_up(PAGE_SIZE);
                let arena = PhysicalRange::from_start_len(candidate, bitmap_pages * PAGE_SIZE);
                (arena.end() <= span.end() && map.is_usable(arena)).then_some(candidate)
            })
            .min()
            .ok_or(super::BootMemError::BitmapDoesNotFit)?;

        let mut node = Self {
            node_id,
            mapper,
            start_pfn: frames.start,
            end_pfn: frames.end,
            bitmap,
            bitmap_pages,
            last_alloc_frame: 0,
            last_alloc_offset: 0,
        };
        node.bitmap_bytes_mut().fill(0xFF);

        log::info!(
            "bootmem node {node_id}: {span:?}, {pages} frames, bitmap at {bitmap} ({bitmap_pages} pages)"
        );
        Ok(node)
    }

    #[inline]
    #[must_use]
    pub const fn node_id(&self) -> usize {
        self.node_id
    }

    /// Byte range spanned by the node.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::new(
            PhysicalPage::from_number(self.start_pfn).base(),
            PhysicalPage::from_number(self.end_pfn).base(),
        )
    }

    /// Byte range of the bitmap arena.
    #[inline]
    #[must_use]
    pub const fn bitmap_range(&self) -> PhysicalRange {
        PhysicalRange::from_start_len(self.bitmap, self.bitmap_pages * PAGE_SIZE)
    }

    #[inline]
    const fn frames(&self) -> u64 {
        self.end_pfn - self.start_pfn
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn bitmap_len(&self) -> usize {
        self.frames().div_ceil(8) as usize
    }

    #[inline]
    const fn arena(&self) -> Range<u64> {
        let first = self.bitmap.page().number();
        first..first + self.bitmap_pages
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn index(&self, pfn: u64) -> usize {
        (pfn - self.start_pfn) as usize
    }

    /// Restrict a frame range to this node.
    fn clip(&self, pfns: Range<u64>) -> Range<u64> {
        let start = pfns.start.max(self.start_pfn);
        let end = pfns.end.min(self.end_pfn);
        if start < end { start..end } else { start..start }
    }

    fn bitmap_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: the arena is exclusively owned by this node.
        unsafe { self.mapper.phys_to_bytes(self.bitmap, self.bitmap_len()) }
    }

    fn bits(&self) -> &BitSlice<u8, Lsb0> {
        let len = self.bitmap_len();
        // Safety: the arena is exclusively owned by this node; `&self`
        // rules out concurrent mutation.
        let bytes = unsafe { core::slice::from_raw_parts(self.mapper.phys_to_ptr(self.bitmap), len) };
        &bytes.view_bits::<Lsb0>()[..self.index(self.end_pfn)]
    }

    fn bits_mut(&mut self) -> &mut BitSlice<u8, Lsb0> {
        let frames = self.index(self.end_pfn);
        &mut self.bitmap_bytes_mut().view_bits_mut::<Lsb0>()[..frames]
    }

    /// Whether `addr` falls inside this node.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        let pfn = addr.page().number();
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    /// State of the frame containing `addr`; `None` outside the node.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> Option<bool> {
        self.contains(addr)
            .then(|| self.bits()[self.index(addr.page().number())])
    }

    /// Number of free frames.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.bits().count_zeros() as u64
    }

    /// Clear the bits of every frame fully covered by `range` that the
    /// memory map reports as usable RAM. The bitmap arena stays allocated.
    ///
    /// Returns the number of frames that changed from allocated to free.
    pub fn mark_free(&mut self, map: MemoryMap<'_>, range: PhysicalRange) -> u64 {
        let arena = self.arena();
        let mut freed = 0;
        for usable in map.usable_within(range) {
            for pfn in self.clip(usable.pages_covered()) {
                if arena.contains(&pfn) {
                    continue;
                }
                let i = self.index(pfn);
                let bits = self.bits_mut();
                if bits[i] {
                    bits.set(i, false);
                    freed += 1;
                }
            }
        }
        log::debug!("bootmem node {}: {range:?} adds {freed} free frames", self.node_id);
        freed
    }

    /// Mark every frame touched by `range` allocated. Idempotent.
    pub fn reserve(&mut self, range: PhysicalRange) {
        let pfns = self.clip(range.pages_touched());
        if pfns.is_empty() {
            return;
        }
        let (first, last) = (self.index(pfns.start), self.index(pfns.end));
        self.bits_mut()[first..last].fill(true);
        log::debug!("bootmem node {}: reserved {range:?}", self.node_id);
    }

    /// Release the frames lying entirely inside `range`.
    ///
    /// Partially covered frames stay allocated. Neither the bitmap arena nor
    /// frames the memory map does not report as usable RAM are ever released
    /// here.
    ///
    /// # Panics
    /// If a covered frame is already free (double free).
    pub fn free(&mut self, map: MemoryMap<'_>, range: PhysicalRange) {
        let pfns = self.clip(range.pages_covered());
        if pfns.is_empty() {
            return;
        }

        if pfns.contains(&self.last_alloc_frame) {
            self.last_alloc_offset = 0;
        }

        let arena = self.arena();
        for pfn in pfns {
            if arena.contains(&pfn) {
                continue;
            }
            let page = PhysicalPage::from_number(pfn);
            if !map.is_usable(PhysicalRange::from_start_len(page.base(), PAGE_SIZE)) {
                log::error!("bootmem node {}: refusing to free non-RAM frame {page}", self.node_id);
                continue;
            }
            let i = self.index(pfn);
            let bits = self.bits_mut();
            assert!(bits[i], "bootmem double free of frame {page}");
            bits.set(i, false);
        }
        log::debug!("bootmem node {}: freed {range:?}", self.node_id);
    }

    /// Allocate `size` zeroed bytes aligned to `align`.
    ///
    /// The scan runs linearly forward from `goal` when it lies inside the
    /// node, from the node start otherwise. A miss above the node start
    /// restarts once from the beginning of the node. No frame at or above
    /// `limit` is handed out.
    ///
    /// `size` must be non-zero and `align` a power of two; the caller checks.
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        goal: Option<PhysicalAddress>,
        limit: Option<PhysicalAddress>,
    ) -> Option<PhysicalAddress> {
        debug_assert!(size > 0 && align.is_power_of_two());

        let min = self.start_pfn;
        let max = limit.map_or(self.end_pfn, |l| self.end_pfn.min(l.page().number()));
        if min >= max {
            return None;
        }
        let step = (align / PAGE_SIZE).max(1);

        let first = align_up(min, step);
        let preferred = match goal.map(|g| g.page().number()) {
            Some(pfn) if pfn >= min && pfn < max => align_up(pfn, step),
            _ => first,
        };

        if let Some(addr) = self.scan(preferred, max, size, align, step) {
            return Some(addr);
        }
        if preferred > first {
            return self.scan(first, max, size, align, step);
        }
        None
    }

    /// First-fit search for `pages_for(size)` free frames in `[from, max)`,
    /// starting on multiples of `step`.
    fn scan(&mut self, from: u64, max: u64, size: u64, align: u64, step: u64) -> Option<PhysicalAddress> {
        let needed = pages_for(size);
        let mut candidate = from;
        while candidate < max {
            let free = self.bits()[self.index(candidate)..self.index(max)].first_zero()? as u64;
            candidate = align_up(candidate + free, step);
            let end = candidate + needed;
            if candidate >= max || end > max {
                return None;
            }
            match self.bits()[self.index(candidate)..self.index(end)].first_one() {
                Some(busy) => candidate = align_up(candidate + busy as u64 + 1, step),
                None => return Some(self.commit(candidate, size, align)),
            }
        }
        None
    }

    /// Claim the run starting at `candidate`, merging into the previous
    /// tail page when it directly precedes the run.
    fn commit(&mut self, candidate: u64, size: u64, align: u64) -> PhysicalAddress {
        let merge = align < PAGE_SIZE
            && self.last_alloc_offset != 0
            && self.last_alloc_frame + 1 == candidate;
        let start = if merge {
            PhysicalPage::from_number(self.last_alloc_frame).base()
                + align_up(self.last_alloc_offset, align)
        } else {
            PhysicalPage::from_number(candidate).base()
        };
        let end = start + size;

        let end_pfn = end.align_up(PAGE_SIZE).page().number();
        if end_pfn > candidate {
            let (first, last) = (self.index(candidate), self.index(end_pfn));
            self.bits_mut()[first..last].fill(true);
        }

        self.last_alloc_frame = end.page().number();
        self.last_alloc_offset = end.page_offset();

        #[allow(clippy::cast_possible_truncation)]
        let len = size as usize;
        // Safety: `[start, end)` was just claimed and is backed by usable RAM.
        unsafe { self.mapper.phys_to_bytes(start, len).fill(0) };

        log::trace!(
            "bootmem node {}: {size:#x} bytes (align {align:#x}) at {start}{}",
            self.node_id,
            if start.page().number() < candidate { " (merged)" } else { "" }
        );
        start
    }

    /// Hand every free frame, then the bitmap arena, to `sink`.
    ///
    /// Consumes the node; nothing is tracked afterwards.
    pub fn retire(self, sink: &mut impl FrameSink) -> RetireReport {
        let mut report = RetireReport::default();
        for i in self.bits().iter_zeros() {
            sink.release_boot_frame(PhysicalPage::from_number(self.start_pfn + i as u64));
            report.free_pages += 1;
        }
        for pfn in self.arena() {
            sink.release_boot_frame(PhysicalPage::from_number(pfn));
            report.bitmap_pages += 1;
        }
        log::info!(
            "bootmem node {} retired: {} free frames, {} bitmap frames released",
            self.node_id,
            report.free_pages,
            report.bitmap_pages
        );
        report
    }
}

impl<M: PhysMapper> core::fmt::Debug for BootMemNode<'_, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BootMemNode")
            .field("node_id", &self.node_id)
            .field("range", &self.range())
            .field("bitmap", &self.bitmap_range())
            .field("free_pages", &self.free_pages())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::{MemoryKind, MemoryMapEntry};
    use kernel_vmem::testing::TestPhys;

    // 64 frames of "RAM" at 1 MiB; a firmware hole at frames 8..10.
    const BASE: u64 = 0x10_0000;
    const MAP: [MemoryMapEntry; 3] = [
        MemoryMapEntry::from_range(BASE, BASE + 8 * PAGE_SIZE, MemoryKind::Usable),
        MemoryMapEntry::from_range(BASE + 8 * PAGE_SIZE, BASE + 10 * PAGE_SIZE, MemoryKind::Reserved),
        MemoryMapEntry::from_range(BASE + 10 * PAGE_SIZE, BASE + 64 * PAGE_SIZE, MemoryKind::Usable),
    ];

    fn pa(frame: u64) -> PhysicalAddress {
        PhysicalAddress::new(BASE + frame * PAGE_SIZE)
    }

    fn map() -> MemoryMap<'static> {
        MemoryMap::new(&MAP)
    }

    fn node(phys: &TestPhys) -> BootMemNode<'_, TestPhys> {
        let mut n = BootMemNode::init(0, phys, map(), phys.range()).unwrap();
        for r in map().usable() {
            n.mark_free(map(), r);
        }
        n
    }

    #[test]
    fn bitmap_sits_at_lowest_usable_page_and_stays_allocated() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let n = node(&phys);
        assert_eq!(n.bitmap_range(), PhysicalRange::new(pa(0), pa(1)));
        assert_eq!(n.is_allocated(pa(0)), Some(true));
        // 64 frames minus the arena and the two-frame hole.
        assert_eq!(n.free_pages(), 61);
        assert_eq!(n.is_allocated(pa(8)), Some(true));
        assert_eq!(n.is_allocated(pa(9)), Some(true));
        assert_eq!(n.is_allocated(pa(64)), None);
    }

    #[test]
    fn bitmap_skips_unusable_head() {
        let map = [
            MemoryMapEntry::from_range(BASE, BASE + 2 * PAGE_SIZE, MemoryKind::Mmio),
            MemoryMapEntry::from_range(BASE + 2 * PAGE_SIZE, BASE + 16 * PAGE_SIZE, MemoryKind::Usable),
        ];
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 16);
        let n = BootMemNode::init(0, &phys, MemoryMap::new(&map), phys.range()).unwrap();
        assert_eq!(n.bitmap_range().start(), pa(2));
        assert_eq!(n.free_pages(), 0);
    }

    #[test]
    fn init_fails_without_room_for_the_bitmap() {
        let map = [MemoryMapEntry::from_range(BASE, BASE + 4 * PAGE_SIZE, MemoryKind::Reserved)];
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 4);
        assert!(matches!(
            BootMemNode::init(0, &phys, MemoryMap::new(&map), phys.range()),
            Err(crate::bootmem::BootMemError::BitmapDoesNotFit)
        ));
    }

    #[test]
    fn reserve_rounds_outward_and_is_idempotent() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        n.reserve(PhysicalRange::new(pa(3) + 1, pa(4) + 1));
        n.reserve(PhysicalRange::new(pa(3) + 1, pa(4) + 1));
        assert_eq!(n.is_allocated(pa(2)), Some(false));
        assert_eq!(n.is_allocated(pa(3)), Some(true));
        assert_eq!(n.is_allocated(pa(4)), Some(true));
        assert_eq!(n.is_allocated(pa(5)), Some(false));
        assert_eq!(n.free_pages(), 59);
    }

    #[test]
    fn partial_free_keeps_page_allocated() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        n.reserve(PhysicalRange::new(pa(5), pa(6)));
        n.free(map(), PhysicalRange::new(pa(5) + 1, pa(5) + PAGE_SIZE - 1));
        assert_eq!(n.is_allocated(pa(5)), Some(true));
        n.free(map(), PhysicalRange::new(pa(5), pa(6)));
        assert_eq!(n.is_allocated(pa(5)), Some(false));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        n.reserve(PhysicalRange::new(pa(20), pa(22)));
        n.free(map(), PhysicalRange::new(pa(20), pa(22)));
        n.free(map(), PhysicalRange::new(pa(20), pa(22)));
    }

    #[test]
    fn small_allocations_share_the_tail_page() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        let free = n.free_pages();

        let a = n.alloc(100, 1, None, None).unwrap();
        assert_eq!(a, pa(1));
        assert_eq!(n.free_pages(), free - 1);

        let b = n.alloc(50, 1, None, None).unwrap();
        assert_eq!(b, a + 100);
        assert_eq!(n.free_pages(), free - 1);

        // Alignment inside the merged page is honoured.
        let c = n.alloc(8, 64, None, None).unwrap();
        assert_eq!(c, a + 192);
        assert_eq!(n.free_pages(), free - 1);
    }

    #[test]
    fn merge_spills_into_following_pages() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        let a = n.alloc(PAGE_SIZE - 16, 8, None, None).unwrap();
        let b = n.alloc(32, 8, None, None).unwrap();
        assert_eq!(b, a + PAGE_SIZE - 16);
        assert_eq!(n.is_allocated(pa(2)), Some(true));
        assert_eq!(n.is_allocated(pa(3)), Some(false));
    }

    #[test]
    fn page_aligned_allocations_never_merge() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        let a = n.alloc(100, 1, None, None).unwrap();
        let b = n.alloc(100, PAGE_SIZE, None, None).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
    }

    #[test]
    fn large_alignment_steps_over_frames() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        let a = n.alloc(PAGE_SIZE, 16 * PAGE_SIZE, None, None).unwrap();
        assert!(a.is_aligned(16 * PAGE_SIZE));
        assert_eq!(a, pa(16));
    }

    #[test]
    fn scan_skips_holes_and_used_runs() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        // Frames 1..8 are free: seven frames, then the hole.
        let a = n.alloc(8 * PAGE_SIZE, PAGE_SIZE, None, None).unwrap();
        assert_eq!(a, pa(10));
    }

    #[test]
    fn goal_and_limit() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, Some(pa(40)), None), Some(pa(40)));
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, None, Some(pa(2))), Some(pa(1)));
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, None, Some(pa(2))), None);
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, None, Some(pa(0))), None);
    }

    #[test]
    fn failed_preferred_scan_restarts_from_node_start() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        // Occupy everything from frame 10 upwards, then ask for a goal up there.
        n.reserve(PhysicalRange::new(pa(10), pa(64)));
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, Some(pa(50)), None), Some(pa(1)));
    }

    #[test]
    fn goal_below_an_earlier_allocation_is_honoured() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, Some(pa(40)), None), Some(pa(40)));
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, Some(pa(20)), None), Some(pa(20)));
        // Without a goal the scan is first-fit from the node start.
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, None, None), Some(pa(1)));
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, None, None), Some(pa(2)));
    }

    #[test]
    fn freed_frames_are_found_again_from_the_start() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        let a = n.alloc(PAGE_SIZE, PAGE_SIZE, None, None).unwrap();
        let b = n.alloc(PAGE_SIZE, PAGE_SIZE, None, None).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        n.free(map(), PhysicalRange::from_start_len(a, PAGE_SIZE));
        assert_eq!(n.alloc(PAGE_SIZE, PAGE_SIZE, None, None), Some(a));
    }

    #[test]
    fn free_never_opens_firmware_holes() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        n.reserve(PhysicalRange::new(pa(6), pa(12)));
        let free = n.free_pages();

        n.free(map(), PhysicalRange::new(pa(6), pa(12)));
        assert_eq!(n.is_allocated(pa(8)), Some(true));
        assert_eq!(n.is_allocated(pa(9)), Some(true));
        // Frames 6, 7, 10 and 11 are RAM and come back.
        assert_eq!(n.free_pages(), free + 4);
        assert_eq!(n.alloc(2 * PAGE_SIZE, PAGE_SIZE, Some(pa(6)), None), Some(pa(6)));
        assert_eq!(n.alloc(3 * PAGE_SIZE, PAGE_SIZE, Some(pa(6)), None), Some(pa(10)));
    }

    #[test]
    fn freed_tail_page_is_not_merged_into() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        let a = n.alloc(100, 1, None, None).unwrap();
        n.free(map(), PhysicalRange::from_start_len(a, PAGE_SIZE));
        let b = n.alloc(100, 1, None, None).unwrap();
        assert_eq!(b, a);
    }

    #[test]
    fn allocations_are_zeroed() {
        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        phys.fill(pa(0), 64 * PAGE_SIZE as usize, 0xCC);
        let mut n = node(&phys);
        let a = n.alloc(300, 8, None, None).unwrap();
        assert!(phys.read_bytes(a, 300).iter().all(|&b| b == 0));
        assert_eq!(phys.read_bytes(a + 300, 1), [0xCC]);
    }

    #[test]
    fn retire_releases_free_frames_then_bitmap() {
        struct Collect(Vec<PhysicalPage>);
        impl FrameSink for Collect {
            fn release_boot_frame(&mut self, page: PhysicalPage) {
                self.0.push(page);
            }
        }

        let phys = TestPhys::new(PhysicalAddress::new(BASE), 64);
        let mut n = node(&phys);
        n.alloc(3 * PAGE_SIZE, PAGE_SIZE, None, None).unwrap();
        let free = n.free_pages();

        let mut sink = Collect(Vec::new());
        let report = n.retire(&mut sink);
        assert_eq!(report.free_pages, free);
        assert_eq!(report.bitmap_pages, 1);
        assert_eq!(sink.0.len() as u64, free + 1);
        assert_eq!(sink.0.last(), Some(&pa(0).page()));
        assert!(!sink.0.contains(&pa(8).page()));
    }
}
