//! # Free Page List
//!
//! The general page allocator that takes over from the boot allocator: an
//! intrusive LIFO of free 4 KiB frames. Each free frame stores the link to
//! the next one in its first eight bytes, so the list needs no memory of its
//! own.
//!
//! ```text
//! head ──► [ next ─┼──────── ] ──► [ next ─┼──────── ] ──► [ 0 │ ... ]
//!           frame 0x1f3000          frame 0x104000          end of list
//! ```
//!
//! Links are stored as `pfn + 1` so that `0` terminates the list.

use crate::bootmem::FrameSink;
use kernel_memory_addresses::PhysicalPage;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};

/// Internally synchronized source of 4 KiB frames.
///
/// This is what the virtual region allocator draws backing pages and
/// page-table frames from.
pub trait PageAllocator {
    /// Take one frame; `None` when memory is exhausted.
    fn alloc_page(&self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_page`](Self::alloc_page).
    fn free_page(&self, page: PhysicalPage);
}

/// Unsynchronized LIFO of free frames.
pub struct FreePageList<'m, M: PhysMapper> {
    mapper: &'m M,
    head: Option<PhysicalPage>,
    len: u64,
}

impl<'m, M: PhysMapper> FreePageList<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            head: None,
            len: 0,
        }
    }

    /// Number of frames on the list.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Push a free frame. The frame's first eight bytes are overwritten.
    pub fn push(&mut self, page: PhysicalPage) {
        let link = self.head.map_or(0, |next| next.number() + 1);
        // Safety: a free frame belongs to the list and is not aliased.
        unsafe { *self.mapper.phys_to_mut::<u64>(page.base()) = link };
        self.head = Some(page);
        self.len += 1;
    }

    /// Pop the most recently pushed frame. Contents are not cleared.
    pub fn pop(&mut self) -> Option<PhysicalPage> {
        let page = self.head?;
        // Safety: `page` is on the list, so its first word is our link.
        let link = unsafe { *self.mapper.phys_to_ref::<u64>(page.base()) };
        self.head = link.checked_sub(1).map(PhysicalPage::from_number);
        self.len -= 1;
        Some(page)
    }
}

impl<M: PhysMapper> FrameSink for FreePageList<'_, M> {
    fn release_boot_frame(&mut self, page: PhysicalPage) {
        self.push(page);
    }
}

impl<M: PhysMapper> FrameAlloc for FreePageList<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.pop()
    }
}

impl<M: PhysMapper> core::fmt::Debug for FreePageList<'_, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FreePageList")
            .field("head", &self.head)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// [`FreePageList`] behind a [`SpinLock`]; the kernel's general page allocator.
pub struct LockedPageList<'m, M: PhysMapper> {
    inner: SpinLock<FreePageList<'m, M>>,
}

impl<'m, M: PhysMapper> LockedPageList<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self::from_list(FreePageList::new(mapper))
    }

    #[must_use]
    pub const fn from_list(list: FreePageList<'m, M>) -> Self {
        Self {
            inner: SpinLock::new(list),
        }
    }

    /// Free frames at the time of the call.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.inner.with_lock(|list| list.len())
    }

    #[must_use]
    pub fn into_inner(self) -> FreePageList<'m, M> {
        self.inner.into_inner()
    }
}

impl<M: PhysMapper + Sync> PageAllocator for LockedPageList<'_, M> {
    fn alloc_page(&self) -> Option<PhysicalPage> {
        let page = self.inner.with_lock(FreePageList::pop);
        if page.is_none() {
            log::warn!("page allocator exhausted");
        }
        page
    }

    fn free_page(&self, page: PhysicalPage) {
        self.inner.with_lock(|list| list.push(page));
    }
}

impl<M: PhysMapper> FrameSink for LockedPageList<'_, M> {
    fn release_boot_frame(&mut self, page: PhysicalPage) {
        self.inner.get_mut().push(page);
    }
}

impl<A: PageAllocator + ?Sized> PageAllocator for &A {
    #[inline]
    fn alloc_page(&self) -> Option<PhysicalPage> {
        (**self).alloc_page()
    }

    #[inline]
    fn free_page(&self, page: PhysicalPage) {
        (**self).free_page(page);
    }
}
