//! # Kernel Memory Configuration
//!
//! The single source of truth for how virtual and physical memory are laid out,
//! shared by the frame allocators, the page-table walker, and the address-space
//! manager.
//!
//! ## Compile-Time Layout ([`memory`])
//!
//! Per-architecture constants for the kernel window, the user window, and the
//! physmap (the fixed-offset window through which the kernel edits page
//! tables), plus allocator limits. Invalid combinations fail to compile.
//!
//! ```text
//! Virtual Address Space (RISC-V Sv39):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        Null guard               │
//! USER_ASPACE_BASE      ├─────────────────────────────────┤ 0x0000_0000_0100_0000
//!                       │        User Space               │
//!                       │   (one AddressSpace per task)   │
//!                       ├─────────────────────────────────┤
//!                       │  Non-canonical hole             │
//! KERNEL_ASPACE_BASE    ├─────────────────────────────────┤ 0xFFFF_FFC0_0000_0000
//!                       │  Physmap, kernel image, heap,   │
//!                       │  MMIO windows                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Runtime Layout ([`VmLayout`])
//!
//! The address-space manager takes its windows from a [`VmLayout`] value rather
//! than reading the constants directly, so tests and unusual boards can carve
//! different windows:
//!
//! ```rust
//! # use kernel_info::VmLayout;
//! # use kernel_memory_addresses::VirtualAddress;
//! let layout = VmLayout {
//!     user_base: VirtualAddress::new(0x0100_0000),
//!     user_size: 0x0F00_0000,
//!     ..VmLayout::native()
//! };
//! assert!(layout.validate().is_ok());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod layout;
pub mod memory;

pub use layout::{InitialMapping, LayoutError, VmLayout};
