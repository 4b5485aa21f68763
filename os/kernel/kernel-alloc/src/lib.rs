//! # Physical Frame Allocation
//!
//! Carves physical RAM into 4 KiB frames and hands them out to the page-table
//! walker (for tables) and the address-space manager (for backing memory).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               PhysicalFrameAllocator                     │
//! │   registry: [SyncOnceCell<Arena>; MAX_ARENAS]            │
//! │   scanned in registration order                          │
//! └───────┬───────────────────────┬──────────────────────────┘
//!         │                       │
//! ┌───────▼─────────────┐ ┌───────▼─────────────┐
//! │ Arena "ram0"        │ │ Arena "ram1"        │   one TicketMutex each
//! │ base, size, flags   │ │ base, size, flags   │
//! │ frames: [Frame; n]  │ │ frames: [Frame; m]  │   in_use + refcount
//! │ free list ◄──► ...  │ │ free list ◄──► ...  │   intrusive, by index
//! └─────────────────────┘ └─────────────────────┘
//! ```
//!
//! ## Contracts
//!
//! * [`FrameAllocator`]: allocate and free frames. Implemented by
//!   [`PhysicalFrameAllocator`] here and by the flat bitmap allocator used on
//!   MMU-less targets.
//! * [`FrameRefs`]: per-frame reference counts. The page-table walker uses them
//!   as live-entry counters for its tables.
//!
//! ## Failure Model
//!
//! Running out of frames is an ordinary [`PmmError`]. Allocation is
//! all-or-nothing: a request that cannot be satisfied completely leaves no
//! frames behind. Broken invariants, such as freeing a frame twice or freeing
//! an address no arena owns, panic: they are caller bugs, and continuing would
//! corrupt the free lists.
//!
//! ## Example
//!
//! ```rust
//! use kernel_alloc::{ArenaFlags, FrameAllocator, PhysicalFrameAllocator};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let pmm = PhysicalFrameAllocator::new();
//! pmm.add_arena("ram", PhysicalAddress::new(0x1000_0000), 0x10_0000, ArenaFlags::new())
//!     .unwrap();
//!
//! let before = pmm.free_count();
//! let frames = pmm.alloc_frames(4).unwrap();
//! assert_eq!(frames.len(), 4);
//! pmm.free_frames(frames);
//! assert_eq!(pmm.free_count(), before);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;
mod frame;
mod free_list;
mod frame_list;
mod pmm;

pub use arena::{Arena, ArenaFlags};
pub use frame::{FrameInfo, FrameState, MAX_REF_COUNT};
pub use frame_list::FrameList;
pub use pmm::PhysicalFrameAllocator;

use kernel_memory_addresses::PhysicalAddress;

/// Recoverable allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    #[error("out of physical memory")]
    NoMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("physical range is already allocated")]
    AlreadyAllocated,
}

/// The physical-allocator contract.
///
/// All methods take `&self`; implementations lock internally.
pub trait FrameAllocator {
    /// Allocate `count` frames, not necessarily contiguous.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if fewer than `count` frames are free. No frames
    /// are kept in that case.
    fn alloc_frames(&self, count: usize) -> Result<FrameList, PmmError>;

    /// Allocate `count` physically contiguous frames whose first address is
    /// aligned to `2^max(align_log2, PAGE_SHIFT)`.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if no arena holds a suitable run,
    /// [`PmmError::InvalidArgument`] for `count == 0` or an impossible alignment.
    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
    ) -> Result<(PhysicalAddress, FrameList), PmmError>;

    /// Claim the specific range `[pa, pa + count * PAGE_SIZE)`.
    ///
    /// # Errors
    /// [`PmmError::AlreadyAllocated`] if any frame in the range is in use,
    /// [`PmmError::NoMemory`] if the range is not inside a single arena,
    /// [`PmmError::InvalidArgument`] if `pa` is not page aligned.
    fn alloc_at(&self, pa: PhysicalAddress, count: usize) -> Result<FrameList, PmmError>;

    /// Allocate `count` contiguous frames the kernel can reach through its
    /// physmap right away. Allocators whose memory is all directly
    /// addressable hand out any contiguous run.
    ///
    /// # Errors
    /// As for [`alloc_contiguous`](Self::alloc_contiguous).
    fn alloc_kmapped(&self, count: usize) -> Result<(PhysicalAddress, FrameList), PmmError> {
        self.alloc_contiguous(count, 0)
    }

    /// Return frames to their arenas. Returns the number of frames freed.
    ///
    /// # Panics
    /// On a double free or a frame that belongs to no arena.
    fn free_frames(&self, frames: FrameList) -> usize;

    /// Total number of free frames.
    fn free_count(&self) -> usize;
}

/// Per-frame reference counting.
pub trait FrameRefs {
    /// Increment the reference count of the allocated frame at `pa` and return
    /// the new count.
    ///
    /// # Panics
    /// If the frame is free, unknown, or the count saturates.
    fn retain_frame(&self, pa: PhysicalAddress) -> u32;

    /// Decrement the reference count of the allocated frame at `pa` and return
    /// the new count.
    ///
    /// # Panics
    /// If the frame is free, unknown, or its count is already zero.
    fn release_frame(&self, pa: PhysicalAddress) -> u32;
}

impl<T: FrameAllocator + ?Sized> FrameAllocator for &T {
    fn alloc_frames(&self, count: usize) -> Result<FrameList, PmmError> {
        (**self).alloc_frames(count)
    }

    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
    ) -> Result<(PhysicalAddress, FrameList), PmmError> {
        (**self).alloc_contiguous(count, align_log2)
    }

    fn alloc_at(&self, pa: PhysicalAddress, count: usize) -> Result<FrameList, PmmError> {
        (**self).alloc_at(pa, count)
    }

    fn alloc_kmapped(&self, count: usize) -> Result<(PhysicalAddress, FrameList), PmmError> {
        (**self).alloc_kmapped(count)
    }

    fn free_frames(&self, frames: FrameList) -> usize {
        (**self).free_frames(frames)
    }

    fn free_count(&self) -> usize {
        (**self).free_count()
    }
}

impl<T: FrameRefs + ?Sized> FrameRefs for &T {
    fn retain_frame(&self, pa: PhysicalAddress) -> u32 {
        (**self).retain_frame(pa)
    }

    fn release_frame(&self, pa: PhysicalAddress) -> u32 {
        (**self).release_frame(pa)
    }
}
