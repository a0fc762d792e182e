//! # Early Kernel Memory Allocators
//!
//! The memory allocators the kernel relies on between "paging is on" and
//! "the general allocator is up", plus the non-contiguous virtual region
//! allocator that builds on the latter.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Virtual Region Allocator (vmalloc)           │
//! │    • guard-separated regions in a fixed window      │
//! │    • reference page table, lazy fault propagation   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ PageAllocator
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Free Page List                         │
//! │    • intrusive LIFO of 4 KiB frames                 │
//! └─────────────────▲───────────────────────────────────┘
//!                   │ FrameSink (retire)
//! ┌─────────────────┴───────────────────────────────────┐
//! │           Boot Memory Allocator (bootmem)           │
//! │    • one bitmap per node, first-fit                 │
//! │    • sub-page merging of small allocations          │
//! └─────────────────▲───────────────────────────────────┘
//!                   │ MemoryMap
//!              firmware memory map
//! ```
//!
//! ## Bring-up sequence
//!
//! 1. [`BootMemory::init_node`](bootmem::BootMemory::init_node) for every
//!    memory node; each node places its bitmap inside itself.
//! 2. [`mark_free`](bootmem::BootMemory::mark_free) the usable ranges of the
//!    memory map, then [`reserve`](bootmem::BootMemory::reserve) the kernel
//!    image, the loader's data and anything else that must survive.
//! 3. Early allocations through [`BootMemory::alloc`](bootmem::BootMemory::alloc)
//!    and its wrappers.
//! 4. [`retire`](bootmem::BootMemory::retire) into a
//!    [`FreePageList`](page_list::FreePageList); the boot allocator is gone
//!    from here on.
//! 5. Build the [`KernelAddressSpace`](vmalloc::KernelAddressSpace) and serve
//!    `vmalloc`/`ioremap`. Other contexts pick up its mappings lazily via
//!    [`handle_fault`](vmalloc::KernelAddressSpace::handle_fault).
//!
//! All physical memory is touched through a [`kernel_vmem::PhysMapper`]:
//! [`phys_mapper::HhdmPhysMapper`] in the kernel, simulated RAM in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bootmem;
pub mod memory_map;
pub mod page_list;
pub mod phys_mapper;
pub mod vmalloc;
