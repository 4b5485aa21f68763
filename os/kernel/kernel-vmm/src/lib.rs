//! # Address-Space Management
//!
//! Hands out virtual memory in named, page-aligned [`Region`]s and keeps the
//! page tables in step with them. The manager is architecture neutral: it is
//! generic over the [`Mmu`](kernel_vmem::Mmu) capability of `kernel-vmem` and
//! over a [`FrameAllocator`](kernel_alloc::FrameAllocator).
//!
//! ```text
//!   Vmm ──── layout: VmLayout (kernel and user windows)
//!    │
//!    ├── kernel: AddressSpace ── TicketMutex ─┬─ regions (sorted, disjoint)
//!    │                                        └─ ArchAspace (root, ASID)
//!    ├── mmu: &T  (T: Mmu)            tables, TLB, context switch
//!    └── pfa: &A  (A: FrameAllocator) backing frames
//! ```
//!
//! ## Region Kinds
//!
//! | Kind                       | Created by                            | Frames returned on free |
//! |:---------------------------|:--------------------------------------|:------------------------|
//! | [`RegionKind::Backed`]     | [`Vmm::alloc`], [`Vmm::alloc_contiguous`] | yes                 |
//! | [`RegionKind::Physical`]   | [`Vmm::alloc_physical`]               | never                   |
//! | [`RegionKind::Reserved`]   | [`Vmm::reserve`], [`Vmm::reserve_initial_mappings`] | nothing is owned |
//!
//! ## Placement
//!
//! A request with a fixed address goes exactly there or fails. Without one, a
//! region goes into the lowest gap of the address space that fits its size at
//! the requested alignment (first fit, at least page aligned). Regions never
//! overlap and never leave their address space.
//!
//! ## Boot and the Physmap
//!
//! Memory in use before the manager existed is handed over with
//! [`Vmm::mark_pages_in_use`] (frames) and [`Vmm::reserve_initial_mappings`]
//! (kernel addresses). [`Vmm::alloc_kpages`] skips regions altogether and
//! returns frames at their physmap address.
//!
//! ## Failure
//!
//! Every allocation is all or nothing. When frames or page tables run out part
//! way through, the mappings already installed are removed and the frames
//! already taken are returned before the [`VmmError`] reaches the caller; the
//! region list is left exactly as it was.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod aspace;
mod error;
mod region;
mod vmm;

pub use crate::aspace::AddressSpace;
pub use crate::error::VmmError;
pub use crate::region::{Region, RegionInfo, RegionKind};
pub use crate::vmm::Vmm;
pub use kernel_vmem::{AspaceKind, MmuFlags};
