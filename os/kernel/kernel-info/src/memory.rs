//! # Memory Layout
//!
//! Every 64-bit target splits its address space into a lower user half and an
//! upper kernel half. 32-bit ARM (LPAE) and hosted builds use the classic
//! 2 GiB / 2 GiB split instead.

/// Lowest user address; the first 16 MiB stay unmapped to catch null
/// dereferences.
pub const USER_ASPACE_BASE: u64 = 0x0100_0000;

/// Gap kept free at the top of the user window.
const USER_TOP_GUARD: u64 = 0x0100_0000;

#[cfg(all(target_arch = "riscv64", not(feature = "sv48")))]
mod arch {
    /// Sv39: upper half starts at the sign-extension of bit 38.
    pub const KERNEL_ASPACE_BASE: u64 = 0xFFFF_FFC0_0000_0000;
    pub const KERNEL_ASPACE_SIZE: u64 = 0x0000_0040_0000_0000;
    pub const LOWER_HALF_END: u64 = 1 << 38;
    pub const PHYSMAP_BASE: u64 = KERNEL_ASPACE_BASE;
    pub const PHYSMAP_PHYS_BASE: u64 = 0;
    pub const PHYSMAP_SIZE: u64 = 0x0000_0010_0000_0000;
}

#[cfg(all(target_arch = "riscv64", feature = "sv48"))]
mod arch {
    pub const KERNEL_ASPACE_BASE: u64 = 0xFFFF_8000_0000_0000;
    pub const KERNEL_ASPACE_SIZE: u64 = 0x0000_8000_0000_0000;
    pub const LOWER_HALF_END: u64 = 1 << 47;
    pub const PHYSMAP_BASE: u64 = KERNEL_ASPACE_BASE;
    pub const PHYSMAP_PHYS_BASE: u64 = 0;
    pub const PHYSMAP_SIZE: u64 = 0x0000_0010_0000_0000;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    /// 48-bit `TTBR1_EL1` half.
    pub const KERNEL_ASPACE_BASE: u64 = 0xFFFF_0000_0000_0000;
    pub const KERNEL_ASPACE_SIZE: u64 = 0x0001_0000_0000_0000;
    pub const LOWER_HALF_END: u64 = 1 << 48;
    pub const PHYSMAP_BASE: u64 = KERNEL_ASPACE_BASE;
    pub const PHYSMAP_PHYS_BASE: u64 = 0;
    pub const PHYSMAP_SIZE: u64 = 0x0000_0010_0000_0000;
}

#[cfg(not(any(target_arch = "riscv64", target_arch = "aarch64")))]
mod arch {
    /// `TTBCR.T1SZ = 1`: `TTBR1` translates the upper 2 GiB.
    pub const KERNEL_ASPACE_BASE: u64 = 0x8000_0000;
    pub const KERNEL_ASPACE_SIZE: u64 = 0x8000_0000;
    pub const LOWER_HALF_END: u64 = KERNEL_ASPACE_BASE;
    /// The first 1 GiB of RAM (starting at `PHYSMAP_PHYS_BASE`) is mapped at
    /// the bottom of the kernel window.
    pub const PHYSMAP_BASE: u64 = KERNEL_ASPACE_BASE;
    pub const PHYSMAP_PHYS_BASE: u64 = 0x4000_0000;
    pub const PHYSMAP_SIZE: u64 = 0x4000_0000;
}

/// Start of the kernel window shared by every address space.
pub const KERNEL_ASPACE_BASE: u64 = arch::KERNEL_ASPACE_BASE;

/// Size of the kernel window in bytes.
pub const KERNEL_ASPACE_SIZE: u64 = arch::KERNEL_ASPACE_SIZE;

/// Size of the default user window.
pub const USER_ASPACE_SIZE: u64 = arch::LOWER_HALF_END - USER_ASPACE_BASE - USER_TOP_GUARD;

/// Virtual address at which physical address [`PHYSMAP_PHYS_BASE`] appears.
///
/// Page tables are edited through this window: a table at physical `pa` is
/// reachable at `PHYSMAP_BASE + (pa - PHYSMAP_PHYS_BASE)`.
pub const PHYSMAP_BASE: u64 = arch::PHYSMAP_BASE;

/// Lowest physical address covered by the physmap.
pub const PHYSMAP_PHYS_BASE: u64 = arch::PHYSMAP_PHYS_BASE;

/// Bytes of RAM the physmap covers.
pub const PHYSMAP_SIZE: u64 = arch::PHYSMAP_SIZE;

/// Capacity of the frame allocator's arena registry.
pub const MAX_ARENAS: usize = 16;

/// Capacity of the flat (MMU-less) allocator's arena registry.
pub const MAX_FLAT_ARENAS: usize = 4;

/// Sub-page leftovers smaller than this are not worth handing out.
pub const MINIMUM_USEFUL_UNALIGNED_SIZE: usize = 64;

const _: () = {
    assert!(KERNEL_ASPACE_BASE.is_multiple_of(4096));
    assert!(KERNEL_ASPACE_SIZE.is_multiple_of(4096));
    assert!(USER_ASPACE_SIZE.is_multiple_of(4096));
    assert!(USER_ASPACE_BASE + USER_ASPACE_SIZE <= KERNEL_ASPACE_BASE);
    assert!(KERNEL_ASPACE_BASE.checked_add(KERNEL_ASPACE_SIZE - 1).is_some());
    assert!(PHYSMAP_BASE >= KERNEL_ASPACE_BASE);
    assert!(PHYSMAP_SIZE <= KERNEL_ASPACE_SIZE - (PHYSMAP_BASE - KERNEL_ASPACE_BASE));
    assert!(MAX_ARENAS > 0 && MAX_ARENAS <= u16::MAX as usize);
    assert!(MAX_FLAT_ARENAS > 0 && MAX_FLAT_ARENAS <= 32);
};
