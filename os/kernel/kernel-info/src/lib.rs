//! # Kernel Memory Configuration
//!
//! Compile-time memory layout and allocator configuration shared by the
//! early memory allocators.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! VMALLOC_START         ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   vmalloc / ioremap window      │
//!                       │   (reference page table only)   │
//! VMALLOC_END           ├─────────────────────────────────┤ 0xffff_e900_0000_0000
//!                       │        Unused                   │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Zones
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     ISA DMA zone                │
//! MAX_DMA     ├─────────────────────────────────┤ 0x0100_0000 (16 MiB)
//!             │     DMA32 zone                  │
//! MAX_DMA32   ├─────────────────────────────────┤ 0x1_0000_0000 (4 GiB)
//!             │     Normal memory               │
//!             └─────────────────────────────────┘
//! ```
//!
//! The boot allocator prefers memory above [`MAX_DMA_ADDRESS`](memory::MAX_DMA_ADDRESS)
//! and uses [`MAX_DMA32_ADDRESS`](memory::MAX_DMA32_ADDRESS) as the zone limit
//! for explicit low-memory requests.
//!
//! All constants are validated by compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
