//! # Virtual Memory: Page-Table Walker
//!
//! Materializes, queries and tears down hardware mappings for the MMUs the
//! kernel runs on. One generic walker ([`PageTableWalker`]) serves every
//! architecture; the architectures differ only in their
//! [`PageTableFormat`] (entry encoding, tree depth) and their
//! [`MmuHardware`] (root register, TLB maintenance).
//!
//! ## Supported Formats
//!
//! | Format      | Levels | Top index | VA bits | ASID bits | Roots                        |
//! |:------------|:-------|:----------|:--------|:----------|:-----------------------------|
//! | [`Sv39`]    | 3      | 9         | 39      | ≤ 16      | `satp`, kernel slots shared  |
//! | [`Sv48`]    | 4      | 9         | 48      | ≤ 16      | `satp`, kernel slots shared  |
//! | [`ArmLpae`] | 3      | 2         | 32      | 8         | `TTBR0` user / `TTBR1` kernel|
//! | [`Arm64`]   | 4      | 9         | 48      | 16        | `TTBR0_EL1` / `TTBR1_EL1`    |
//!
//! ## Virtual Address → Physical Address Walk
//!
//! Every level below the root resolves 9 bits of the virtual address; the root
//! resolves [`PageTableFormat::TOP_INDEX_BITS`]. Levels are numbered from the
//! leaf up, so a 4-level walk of a 48-bit address reads:
//!
//! ```text
//! | 47‒39   | 38‒30   | 29‒21   | 20‒12   | 11‒0   |
//! | level 3 | level 2 | level 1 | level 0 | offset |
//!
//!  root  →  table  →  table  →  table  →  4 KiB page
//!   L3        L2        L1        L0
//!             │         │
//!             │         └── a leaf here maps a 2 MiB block
//!             └──────────── a leaf here maps a 1 GiB block
//! ```
//!
//! The walker itself only installs 4 KiB leaves, but [`Mmu::query`]
//! understands blocks built by boot code.
//!
//! ## Layers
//!
//! ```text
//!   kernel-vmm (AddressSpace, Region)
//!        │  generic over
//!        ▼
//!   Mmu ◄── PageTableWalker<F, M, H, A>
//!              │   │   │   └─ A: FrameAllocator + FrameRefs (tables, live counts)
//!              │   │   └───── H: MmuHardware (satp / TTBRn, TLB)
//!              │   └───────── M: PhysMapper (physical table → &mut PageTable)
//!              └───────────── F: PageTableFormat (Sv39, Sv48, ArmLpae, Arm64)
//! ```
//!
//! ## Flags
//!
//! [`MmuFlags`] is architecture neutral. Formats normalize what they cannot
//! express; RISC-V has no per-page memory type, so a query there always reports
//! [`CachePolicy::Cached`]:
//!
//! ```rust
//! use kernel_vmem::{CachePolicy, MmuFlags};
//!
//! let mmio = MmuFlags::DEVICE;
//! assert!(mmio.writable() && !mmio.executable());
//! assert_eq!(mmio.cache(), CachePolicy::Device);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod arch;
mod asid;
mod flags;
mod format;
pub mod hardware;
mod mmu;
mod table;
mod walker;

pub use crate::arch::{Arm64, ArmLpae, LongDescriptor, RiscvPte, Sv39, Sv48};
pub use crate::asid::AsidPool;
pub use crate::flags::{CachePolicy, MmuFlags};
pub use crate::format::{INDEX_BITS, MAX_LEVELS, PageTableFormat, Slot};
pub use crate::hardware::MmuHardware;
pub use crate::mmu::{ArchAspace, AspaceKind, Mmu};
pub use crate::table::{ENTRIES, PageTable};
pub use crate::walker::PageTableWalker;

#[cfg(any(target_arch = "riscv64", target_arch = "aarch64", target_arch = "arm"))]
pub use crate::arch::NativeFormat;
#[cfg(any(target_arch = "riscv64", target_arch = "aarch64", target_arch = "arm"))]
pub use crate::hardware::NativeHardware;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Recoverable failures of [`Mmu::map`] and [`Mmu::init_aspace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No frame for the table at `level` on the walk to `va`.
    #[error("no memory for a level {level} table while mapping {va}")]
    NoMemory { va: VirtualAddress, level: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Failures of [`Mmu::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("nothing is mapped at {0}")]
    NotFound(VirtualAddress),
    #[error("{0} is outside the address space")]
    OutOfRange(VirtualAddress),
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (the kernel physmap, or an identity map
/// during early boot).
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation. The walker only ever asks for
    /// [`PageTable`]s at addresses it allocated or adopted.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<T: PhysMapper + ?Sized> PhysMapper for &T {
    unsafe fn phys_to_mut<'a, U>(&self, pa: PhysicalAddress) -> &'a mut U {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// A [`PhysMapper`] over a fixed-offset window: physical `phys_base` appears
/// at virtual `virt_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPhysMapper {
    virt_base: VirtualAddress,
    phys_base: PhysicalAddress,
}

impl OffsetPhysMapper {
    #[must_use]
    pub const fn new(virt_base: VirtualAddress, phys_base: PhysicalAddress) -> Self {
        Self {
            virt_base,
            phys_base,
        }
    }

    /// The kernel physmap ([`info::PHYSMAP_BASE`]).
    #[must_use]
    pub const fn native() -> Self {
        Self::new(
            VirtualAddress::new(info::PHYSMAP_BASE),
            PhysicalAddress::new(info::PHYSMAP_PHYS_BASE),
        )
    }

    /// Where `pa` appears in the window.
    #[inline]
    #[must_use]
    pub const fn virt_of(&self, pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(pa.as_u64() >= self.phys_base.as_u64());
        VirtualAddress::new(self.virt_base.as_u64() + (pa.as_u64() - self.phys_base.as_u64()))
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        #[allow(clippy::cast_possible_truncation)]
        let addr = self.virt_of(pa).as_u64() as usize;
        let ptr = core::ptr::with_exposed_provenance_mut::<T>(addr);
        // SAFETY: the caller guarantees the window maps `pa` and holds a `T`.
        unsafe { &mut *ptr }
    }
}
