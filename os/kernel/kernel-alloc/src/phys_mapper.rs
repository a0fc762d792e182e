//! # HHDM-based `PhysMapper`
//!
//! With a higher-half direct map every physical address is visible at
//! `HHDM_BASE + pa`. That is all the boot allocator (bitmap, zero-fill), the
//! free page list (intrusive links) and the page-table code need in order to
//! touch physical memory once the loader has built the HHDM.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let mapper = HhdmPhysMapper;
//! let table: &PageTable = unsafe { mapper.phys_to_ref(PhysicalAddress::new(0x1234_0000)) };
//! assert_eq!(table.present_entries().count(), 0);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// The HHDM must be present and cover every physical address passed in;
/// the mapper itself performs no checks.
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (HHDM_BASE + pa.as_u64()) as *mut u8
    }
}
