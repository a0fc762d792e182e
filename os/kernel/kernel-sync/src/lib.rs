//! # Kernel synchronization primitives
//!
//! A single busy-waiting [`SpinLock`]. The memory allocators only need mutual
//! exclusion around short, non-blocking critical sections (region list scans
//! and page-table updates), so no sleeping locks or IRQ masking live here.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
