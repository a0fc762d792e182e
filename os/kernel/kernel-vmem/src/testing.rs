//! # Host-side paging test support
//!
//! [`TestPhys`] simulates a window of physical memory with a heap buffer of
//! 4 KiB-aligned frames. Physical addresses are byte offsets from a
//! configurable base, so tests can place "RAM" anywhere (e.g. above the
//! DMA zone). [`BumpFrameAlloc`] hands out frames from a range in order.

use crate::{FrameAlloc, PhysMapper};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, PhysicalRange};

/// One 4 KiB frame of simulated RAM.
#[repr(C, align(4096))]
#[derive(Copy, Clone)]
struct Frame([u8; 4096]);

/// Simulated physical memory `[base, base + frames * 4096)`.
///
/// Memory starts zeroed. Accesses outside the window panic.
pub struct TestPhys {
    base: PhysicalAddress,
    frames: NonNull<[Frame]>,
}

// Safety: `TestPhys` only hands out raw pointers; synchronizing accesses
// through them is up to the callers, exactly as with real RAM.
unsafe impl Send for TestPhys {}
unsafe impl Sync for TestPhys {}

impl TestPhys {
    /// # Panics
    /// If `base` is not page aligned.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        assert!(base.is_page_aligned(), "simulated RAM must start on a page boundary");
        let buffer: Box<[Frame]> = vec![Frame([0; 4096]); frames].into_boxed_slice();
        Self {
            base,
            frames: NonNull::from(Box::leak(buffer)),
        }
    }

    /// The simulated physical window.
    #[must_use]
    pub fn range(&self) -> PhysicalRange {
        PhysicalRange::from_start_len(self.base, self.frames.len() as u64 * PAGE_SIZE)
    }

    /// Copies `len` bytes starting at `pa`.
    #[must_use]
    pub fn read_bytes(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        // Safety: bounds are checked by `phys_to_ptr`; we only read.
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr(pa), len).to_vec() }
    }

    /// Fills `[pa, pa + len)` with `byte`.
    pub fn fill(&self, pa: PhysicalAddress, len: usize, byte: u8) {
        // Safety: bounds are checked by `phys_to_ptr`.
        unsafe { self.phys_to_bytes(pa, len).fill(byte) };
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(
            self.range().contains(pa),
            "{pa} lies outside simulated RAM {:?}",
            self.range()
        );
        #[allow(clippy::cast_possible_truncation)]
        let offset = (pa - self.base) as usize;
        // Safety: `offset` is inside the leaked buffer.
        unsafe { self.frames.cast::<u8>().as_ptr().add(offset) }
    }

    unsafe fn phys_to_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let end = pa.as_u64() + len as u64;
        assert!(
            end <= self.range().end().as_u64(),
            "{pa} + {len:#x} lies outside simulated RAM {:?}",
            self.range()
        );
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(pa), len) }
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        // Safety: the pointer came from `Box::leak` in `new`.
        drop(unsafe { Box::from_raw(self.frames.as_ptr()) });
    }
}

/// Hands out consecutive frames from a physical range; never frees.
#[derive(Debug, Clone)]
pub struct BumpFrameAlloc {
    next: u64,
    end: u64,
    allocated: usize,
}

impl BumpFrameAlloc {
    /// Bump over the whole pages of `range`.
    #[must_use]
    pub const fn new(range: PhysicalRange) -> Self {
        let pages = range.pages_covered();
        Self {
            next: pages.start,
            end: pages.end,
            allocated: 0,
        }
    }

    /// Frames handed out so far.
    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    /// Frames still available.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl FrameAlloc for BumpFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        if self.next >= self.end {
            return None;
        }
        let page = PhysicalPage::from_number(self.next);
        self.next += 1;
        self.allocated += 1;
        Some(page)
    }
}
