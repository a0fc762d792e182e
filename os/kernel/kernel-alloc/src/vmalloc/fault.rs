//! # Fault-time propagation
//!
//! Address spaces created before a vmalloc mapping existed lack the
//! top-level entry that leads to it. The first access from such a context
//! faults; the handler copies the missing entry from the reference table
//! and the access is retried.
//!
//! ```text
//!  ctx PML4                reference PML4
//!  [402] empty   ◄─copy─   [402] ─► PDPT ─► PD ─► PT ─► page
//! ```
//!
//! The reference table is read without taking the region lock: entries are
//! atomics, top-level entries of the window are only ever filled in, and the
//! tables below them are never freed.

use crate::page_list::PageAllocator;
use crate::vmalloc::KernelAddressSpace;
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, PhysMapper};

/// Outcome of a handled fault; the faulting access can be retried.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultResolution {
    /// The missing top-level entry was copied into the context.
    Synchronized,
    /// The context already had the entry (spurious fault or stale TLB).
    AlreadySynchronized,
}

/// A fault the vmalloc window cannot resolve; a genuine access violation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("{0} lies outside the vmalloc window")]
    OutsideManagedRange(VirtualAddress),
    #[error("{0} is not mapped in the reference table")]
    NotMapped(VirtualAddress),
    #[error("user-mode access to kernel address {0}")]
    UserAccess(VirtualAddress),
    #[error("protection violation at {0}: {1}")]
    ProtectionViolation(VirtualAddress, &'static str),
}

/// Page-fault error code pushed by the CPU (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64,
}

impl PageFaultErrorCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.reserved_bit() {
            "reserved bit set in a paging structure"
        } else if self.protection_key() {
            "protection-key violation"
        } else if self.instruction_fetch() {
            "instruction fetch from a non-executable page"
        } else if self.write() {
            "write access to a read-only page"
        } else {
            "read access to a protected page"
        }
    }
}

impl<M: PhysMapper, P: PageAllocator> KernelAddressSpace<'_, M, P> {
    /// Resolve a non-present fault at `addr` taken while `ctx` was active.
    ///
    /// Copies the reference top-level entry covering `addr` into `ctx` if it
    /// is missing there. Copying is idempotent, so concurrent faults on the
    /// same slot from different CPUs are harmless.
    ///
    /// # Errors
    /// - [`FaultError::OutsideManagedRange`] if `addr` is not in the window.
    /// - [`FaultError::NotMapped`] if the reference table has no mapping for
    ///   `addr` either (e.g. a guard page or a freed region).
    pub fn handle_fault(&self, ctx: &AddressSpace<'_, M>, addr: VirtualAddress) -> Result<FaultResolution, FaultError> {
        if !self.window.contains(addr) {
            return Err(FaultError::OutsideManagedRange(addr));
        }
        if !self.reference.top_level_entry(addr).present() {
            log::warn!("vmalloc fault at {addr}: no reference entry");
            return Err(FaultError::NotMapped(addr));
        }

        let installed = ctx.copy_top_level_entry(&self.reference, addr);
        if installed {
            log::debug!("vmalloc fault at {addr}: top-level entry copied into {}", ctx.root_page());
        }
        if self.reference.query(addr).is_none() {
            log::warn!("vmalloc fault at {addr}: address is not mapped");
            return Err(FaultError::NotMapped(addr));
        }

        Ok(if installed {
            FaultResolution::Synchronized
        } else {
            FaultResolution::AlreadySynchronized
        })
    }

    /// Entry point for the `#PF` handler.
    ///
    /// Only supervisor faults on non-present pages can be caused by a
    /// missing top-level entry; everything else is reported as is.
    ///
    /// # Errors
    /// [`FaultError::UserAccess`] and [`FaultError::ProtectionViolation`]
    /// for faults that are not propagation candidates, otherwise those of
    /// [`handle_fault`](Self::handle_fault).
    pub fn handle_page_fault(
        &self,
        ctx: &AddressSpace<'_, M>,
        addr: VirtualAddress,
        code: PageFaultErrorCode,
    ) -> Result<FaultResolution, FaultError> {
        if code.user() {
            return Err(FaultError::UserAccess(addr));
        }
        if code.present() {
            return Err(FaultError::ProtectionViolation(addr, code.explain()));
        }
        self.handle_fault(ctx, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_list::{FreePageList, LockedPageList};
    use kernel_info::memory::VMALLOC_START;
    use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualRange};
    use kernel_vmem::testing::TestPhys;

    fn pages_of(phys: &TestPhys) -> LockedPageList<'_, TestPhys> {
        let mut list = FreePageList::new(phys);
        for pfn in phys.range().pages_covered() {
            list.push(PhysicalPage::from_number(pfn));
        }
        LockedPageList::from_list(list)
    }

    fn window() -> VirtualRange {
        VirtualRange::new(
            VirtualAddress::new(VMALLOC_START),
            VirtualAddress::new(VMALLOC_START + 2 * (1 << 39)),
        )
    }

    #[test]
    fn error_code_bits() {
        let code = PageFaultErrorCode::from_bits(0b10011);
        assert!(code.present() && code.write() && code.instruction_fetch());
        assert!(!code.user());
        assert_eq!(code.explain(), "instruction fetch from a non-executable page");
        assert_eq!(PageFaultErrorCode::new().explain(), "non-present page");
    }

    #[test]
    fn missing_entry_is_copied_once() {
        let phys = TestPhys::new(PhysicalAddress::new(0x20_0000), 32);
        let pages = pages_of(&phys);
        let kas = KernelAddressSpace::new(&phys, window(), &pages).unwrap();
        let ctx = unsafe { AddressSpace::new_empty(&phys, pages.alloc_page().unwrap()) };

        let va = kas.vmalloc(PAGE_SIZE).unwrap();
        assert_eq!(ctx.query(va), None);
        assert_eq!(kas.handle_fault(&ctx, va), Ok(FaultResolution::Synchronized));
        assert_eq!(ctx.query(va), kas.translate(va));
        assert_eq!(kas.handle_fault(&ctx, va), Ok(FaultResolution::AlreadySynchronized));
        // The reference itself never needs propagation.
        assert_eq!(
            kas.handle_fault(kas.reference(), va),
            Ok(FaultResolution::AlreadySynchronized)
        );
    }

    #[test]
    fn violations_are_reported() {
        let phys = TestPhys::new(PhysicalAddress::new(0x20_0000), 32);
        let pages = pages_of(&phys);
        let kas = KernelAddressSpace::new(&phys, window(), &pages).unwrap();
        let ctx = unsafe { AddressSpace::new_empty(&phys, pages.alloc_page().unwrap()) };

        let outside = VirtualAddress::new(0xFFFF_8880_0000_1000);
        assert_eq!(kas.handle_fault(&ctx, outside), Err(FaultError::OutsideManagedRange(outside)));

        // Empty reference slot.
        let second_slot = VirtualAddress::new(VMALLOC_START + (1 << 39));
        assert_eq!(kas.handle_fault(&ctx, second_slot), Err(FaultError::NotMapped(second_slot)));

        // Guard page behind a live region: the entry is copied, the page is not mapped.
        let va = kas.vmalloc(PAGE_SIZE).unwrap();
        let guard = va + PAGE_SIZE;
        assert_eq!(kas.handle_fault(&ctx, guard), Err(FaultError::NotMapped(guard)));
        assert_eq!(kas.handle_fault(&ctx, va), Ok(FaultResolution::AlreadySynchronized));

        let user = PageFaultErrorCode::new().with_user(true);
        assert_eq!(kas.handle_page_fault(&ctx, va, user), Err(FaultError::UserAccess(va)));
        let write = PageFaultErrorCode::new().with_present(true).with_write(true);
        assert!(matches!(
            kas.handle_page_fault(&ctx, va, write),
            Err(FaultError::ProtectionViolation(_, "write access to a read-only page"))
        ));
        assert_eq!(
            kas.handle_page_fault(&ctx, va, PageFaultErrorCode::new()),
            Ok(FaultResolution::AlreadySynchronized)
        );
    }
}
