use crate::page_list::PageAllocator;
use kernel_memory_addresses::PhysicalPage;
use kernel_vmem::FrameAlloc;

/// Page-table frames obtained ahead of a mapping.
///
/// The region lock must not be held while calling the page allocator, so
/// the frames [`AddressSpace::ensure_chain`](kernel_vmem::AddressSpace::ensure_chain)
/// might need are taken beforehand and handed in through [`FrameAlloc`].
/// Tables are never freed, so the number of missing tables observed before
/// taking the lock is an upper bound for what is missing once it is held.
#[derive(Debug, Default)]
pub(crate) struct TableReserve {
    frames: [Option<PhysicalPage>; 3],
    len: usize,
}

impl TableReserve {
    pub const fn new() -> Self {
        Self {
            frames: [None; 3],
            len: 0,
        }
    }

    /// Top up to `needed` frames.
    ///
    /// Returns `false` if the page allocator ran dry; frames obtained so far
    /// stay in the reserve.
    pub fn fill(&mut self, pages: &impl PageAllocator, needed: usize) -> bool {
        debug_assert!(needed <= self.frames.len());
        while self.len < needed {
            let Some(frame) = pages.alloc_page() else {
                return false;
            };
            self.frames[self.len] = Some(frame);
            self.len += 1;
        }
        true
    }

    /// Return unused frames to the page allocator.
    pub fn release(&mut self, pages: &impl PageAllocator) {
        while let Some(frame) = self.alloc_4k() {
            pages.free_page(frame);
        }
    }
}

impl FrameAlloc for TableReserve {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.len = self.len.checked_sub(1)?;
        self.frames[self.len].take()
    }
}
