//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window reserved for non-contiguous kernel mappings
/// (`vmalloc` / `ioremap`). PML4 slot 402.
pub const VMALLOC_START: u64 = 0xffff_c900_0000_0000;

/// End (exclusive) of the `vmalloc` window. 32 TiB, i.e. 64 PML4 slots.
pub const VMALLOC_END: u64 = 0xffff_e900_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Upper bound of ISA DMA-capable memory.
///
/// Boot allocations that do not ask for low memory start searching above
/// this address so the scarce DMA zone is left for drivers that need it.
pub const MAX_DMA_ADDRESS: u64 = 0x0100_0000; // 16 MiB

/// Upper bound of 32-bit DMA-capable memory; the zone limit of "low" boot allocations.
pub const MAX_DMA32_ADDRESS: u64 = 0x1_0000_0000; // 4 GiB

/// Cache line size used as the default alignment of small boot allocations.
pub const SMP_CACHE_BYTES: u64 = 64;

/// Maximum number of memory nodes the boot allocator tracks.
pub const MAX_NUMNODES: usize = 4;

const _: () = {
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(VMALLOC_START > HHDM_BASE);
    assert!(VMALLOC_END > VMALLOC_START);
    assert!(KERNEL_BASE > VMALLOC_END);
    // The window must cover whole top-level entries so that fault-time
    // propagation never copies an entry shared with another window.
    assert!(VMALLOC_START.is_multiple_of(1 << 39));
    assert!(VMALLOC_END.is_multiple_of(1 << 39));
    assert!(MAX_DMA32_ADDRESS > MAX_DMA_ADDRESS);
    assert!(SMP_CACHE_BYTES.is_power_of_two());
    assert!(MAX_NUMNODES > 0);
};
