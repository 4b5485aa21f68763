//! # Flat Page Allocation
//!
//! The page allocator for targets without an MMU. Physical addresses are used
//! directly, so there is no page-table walker and no address-space manager on
//! top of it; callers receive raw page runs.
//!
//! Each arena is a page-aligned range plus a bitmap with one bit per page. The
//! bitmap either comes from the caller ([`FlatAllocator::add_arena`]) or is
//! carved out of the arena's own first bytes
//! ([`FlatAllocator::add_arena_embedded`]).
//!
//! ```text
//!  raw start                                   first usable page
//!  │ bitmap words │ remainder (≥ 64 B, optional) │ page │ page │ ...
//!  └──────── pages covering the bitmap are marked allocated ────┘
//! ```
//!
//! The allocator implements [`FrameAllocator`], so code written against the
//! frame-allocator contract runs unchanged on MMU-less builds.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod arena;
mod bitmap;

use crate::arena::FlatArena;
use crate::bitmap::PageBitmap;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::{FrameAllocator, FrameList, PmmError};
use kernel_info::memory::{MAX_FLAT_ARENAS, MINIMUM_USEFUL_UNALIGNED_SIZE};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_down, align_up};
use kernel_sync::{SpinMutex, SyncOnceCell};
use log::{debug, error, info, warn};

/// Arena mask selecting every arena.
pub const ARENA_ANY: u32 = u32::MAX;

/// Bitmap-based page allocator over up to [`MAX_FLAT_ARENAS`] arenas.
pub struct FlatAllocator {
    arenas: [SyncOnceCell<FlatArena>; MAX_FLAT_ARENAS],
    registered: AtomicUsize,
    registry: SpinMutex<()>,
}

/// Page-aligned bounds of a raw range.
struct Bounds {
    raw: u64,
    base: u64,
    pages: usize,
}

impl Bounds {
    fn of(name: &str, start: PhysicalAddress, size: u64) -> Result<Self, PmmError> {
        let raw = start.as_u64();
        let end = raw.checked_add(size).map(|e| align_down(e, PAGE_SIZE));
        let base = align_up(raw, PAGE_SIZE);
        match (base, end) {
            (Some(base), Some(end)) if end > base => Ok(Self {
                raw,
                base,
                pages: usize::try_from((end - base) >> PAGE_SHIFT)
                    .map_err(|_| PmmError::InvalidArgument)?,
            }),
            _ => {
                warn!("novm: arena '{name}' at {start} size {size:#x} holds no whole page");
                Err(PmmError::InvalidArgument)
            }
        }
    }
}

impl FlatAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arenas: [const { SyncOnceCell::new() }; MAX_FLAT_ARENAS],
            registered: AtomicUsize::new(0),
            registry: SpinMutex::new(()),
        }
    }

    /// Register `[start, start + size)` tracked by the caller-provided `map`.
    ///
    /// `start` is rounded up and the end rounded down to a page. A leftover of
    /// at least 64 bytes in front of the first page is kept for
    /// [`alloc_unaligned_remainder`](Self::alloc_unaligned_remainder).
    ///
    /// # Errors
    /// - [`PmmError::InvalidArgument`] if the range holds no whole page,
    ///   overlaps another arena, or `map` is too small.
    /// - [`PmmError::NoMemory`] if the registry is full.
    pub fn add_arena(
        &self,
        name: &'static str,
        start: PhysicalAddress,
        size: u64,
        map: &'static mut [u64],
    ) -> Result<(), PmmError> {
        let bounds = Bounds::of(name, start, size)?;
        if map.len() < PageBitmap::words_for(bounds.pages) {
            warn!(
                "novm: bitmap for '{name}' holds {} pages, arena needs {}",
                map.len() * 64,
                bounds.pages
            );
            return Err(PmmError::InvalidArgument);
        }

        let gap = bounds.base - bounds.raw;
        let remainder = Self::useful(bounds.raw, gap);
        self.register(name, &bounds, PageBitmap::new(map, bounds.pages), remainder, 0)
    }

    /// Register `[start, start + size)` with its bitmap stored at the start
    /// of the range itself.
    ///
    /// The pages the bitmap occupies are marked allocated.
    ///
    /// # Errors
    /// As for [`add_arena`](Self::add_arena); additionally
    /// [`PmmError::InvalidArgument`] if the bitmap would fill the whole range.
    ///
    /// # Safety
    /// `start` must be directly dereferenceable (identity mapped) and
    /// `[start, start + size)` must be RAM that nothing else uses, for the
    /// rest of the program.
    pub unsafe fn add_arena_embedded(
        &self,
        name: &'static str,
        start: PhysicalAddress,
        size: u64,
    ) -> Result<(), PmmError> {
        let bounds = Bounds::of(name, start, size)?;
        let words = PageBitmap::words_for(bounds.pages);

        let map_start = align_up(bounds.raw, 8).ok_or(PmmError::InvalidArgument)?;
        let map_end = map_start + words as u64 * 8;
        let usable = align_up(map_end, PAGE_SIZE)
            .ok_or(PmmError::InvalidArgument)?
            .max(bounds.base);
        let carved = usize::try_from((usable - bounds.base) >> PAGE_SHIFT)
            .map_err(|_| PmmError::InvalidArgument)?;
        if carved >= bounds.pages {
            warn!("novm: arena '{name}' at {start} is too small for its own bitmap");
            return Err(PmmError::InvalidArgument);
        }

        let (base, bytes) = (PhysicalAddress::new(bounds.base), (bounds.pages as u64) << PAGE_SHIFT);
        if let Some(other) = self.arenas().find(|a| a.overlaps(base, bytes)) {
            warn!("novm: arena '{name}' at {base} overlaps '{}'", other.name());
            return Err(PmmError::InvalidArgument);
        }

        let addr = usize::try_from(map_start).map_err(|_| PmmError::InvalidArgument)?;
        // SAFETY: the caller guarantees the range is identity mapped, unused
        // RAM owned by us from now on; `map_start` is 8-aligned and the words
        // end before `usable`, inside the range.
        let map = unsafe {
            core::slice::from_raw_parts_mut(core::ptr::with_exposed_provenance_mut::<u64>(addr), words)
        };

        let remainder = Self::useful(map_end, usable - map_end);
        let mut bitmap = PageBitmap::new(map, bounds.pages);
        bitmap.set_range(0, carved);
        self.register(name, &bounds, bitmap, remainder, carved)
    }

    fn useful(at: u64, len: u64) -> Option<(PhysicalAddress, usize)> {
        let len = usize::try_from(len).ok()?;
        (len >= MINIMUM_USEFUL_UNALIGNED_SIZE).then_some((PhysicalAddress::new(at), len))
    }

    fn register(
        &self,
        name: &'static str,
        bounds: &Bounds,
        map: PageBitmap,
        remainder: Option<(PhysicalAddress, usize)>,
        carved: usize,
    ) -> Result<(), PmmError> {
        let base = PhysicalAddress::new(bounds.base);
        let size = (bounds.pages as u64) << PAGE_SHIFT;

        let _registry = self.registry.lock();
        if let Some(other) = self.arenas().find(|a| a.overlaps(base, size)) {
            warn!("novm: arena '{name}' at {base} overlaps '{}'", other.name());
            return Err(PmmError::InvalidArgument);
        }

        let slot = self.registered.load(Ordering::Acquire);
        if slot >= MAX_FLAT_ARENAS {
            warn!("novm: arena registry full, dropping '{name}'");
            return Err(PmmError::NoMemory);
        }
        if self.arenas[slot]
            .set(FlatArena::new(name, base, map, remainder))
            .is_err()
        {
            error!("novm: arena slot {slot} already occupied");
            return Err(PmmError::InvalidArgument);
        }
        self.registered.store(slot + 1, Ordering::Release);

        info!(
            "novm: arena '{name}' {base}..{} ({} pages, {carved} for the bitmap)",
            base + size,
            bounds.pages
        );
        Ok(())
    }

    fn arenas(&self) -> impl Iterator<Item = &FlatArena> + '_ {
        let n = self.registered.load(Ordering::Acquire);
        self.arenas[..n].iter().filter_map(SyncOnceCell::get)
    }

    fn arena_of(&self, pa: PhysicalAddress) -> Option<&FlatArena> {
        self.arenas().find(|a| a.contains(pa))
    }

    /// `(base, size)` of every registered arena, in registration order.
    pub fn arena_ranges(&self) -> impl Iterator<Item = (PhysicalAddress, u64)> + '_ {
        self.arenas().map(|a| (a.base(), a.size()))
    }

    /// Allocate `count` consecutive pages from any arena.
    ///
    /// # Errors
    /// [`PmmError::InvalidArgument`] for `count == 0`, [`PmmError::NoMemory`]
    /// if no arena has a long enough free run.
    pub fn alloc_pages(&self, count: usize) -> Result<PhysicalAddress, PmmError> {
        self.alloc_pages_in(count, ARENA_ANY)
    }

    /// Allocate `count` consecutive pages from the arenas whose bit is set in
    /// `arena_mask` (bit `i` selects the `i`-th registered arena).
    ///
    /// # Errors
    /// As for [`alloc_pages`](Self::alloc_pages).
    pub fn alloc_pages_in(&self, count: usize, arena_mask: u32) -> Result<PhysicalAddress, PmmError> {
        if count == 0 {
            return Err(PmmError::InvalidArgument);
        }
        let pa = self
            .arenas()
            .enumerate()
            .filter(|&(i, _)| arena_mask & (1 << i) != 0)
            .find_map(|(_, arena)| arena.alloc_run(count, 0, 1))
            .ok_or(PmmError::NoMemory)?;
        debug!("novm: {count} pages at {pa}");
        Ok(pa)
    }

    /// Claim exactly `[pa, pa + count pages)`.
    ///
    /// # Errors
    /// - [`PmmError::AlreadyAllocated`] if any page is in use; nothing is
    ///   claimed then.
    /// - [`PmmError::NoMemory`] if the range is not inside one arena.
    /// - [`PmmError::InvalidArgument`] if `pa` is not page aligned.
    pub fn alloc_specific(&self, pa: PhysicalAddress, count: usize) -> Result<(), PmmError> {
        if !pa.is_page_aligned() {
            return Err(PmmError::InvalidArgument);
        }
        if count == 0 {
            return Ok(());
        }
        self.arena_of(pa).ok_or(PmmError::NoMemory)?.alloc_range(pa, count)
    }

    /// Return `count` pages starting at `pa`.
    ///
    /// # Panics
    /// If `pa` belongs to no arena or any page in the range is already free.
    pub fn free_pages(&self, pa: PhysicalAddress, count: usize) {
        let Some(arena) = self.arena_of(pa) else {
            error!("novm: free of {pa} outside every arena");
            panic!("free of {pa} outside every arena");
        };
        arena.free_range(pa.page_base(), count);
        debug!("novm: freed {count} pages at {pa}");
    }

    /// Hand out the first arena's sub-page leftover, once; afterwards (or if
    /// there never was one) a single whole page.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if the fallback page cannot be allocated.
    pub fn alloc_unaligned_remainder(&self) -> Result<(PhysicalAddress, usize), PmmError> {
        if let Some(remainder) = self.arenas().next().and_then(FlatArena::take_remainder) {
            return Ok(remainder);
        }
        #[allow(clippy::cast_possible_truncation)]
        let page = PAGE_SIZE as usize;
        self.alloc_pages(1).map(|pa| (pa, page))
    }

    /// Dump every arena at `info` level.
    pub fn log_arenas(&self) {
        for arena in self.arenas() {
            arena.log_state();
        }
    }
}

impl Default for FlatAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for FlatAllocator {
    /// Always contiguous: the bitmap scan only finds whole runs.
    fn alloc_frames(&self, count: usize) -> Result<FrameList, PmmError> {
        if count == 0 {
            return Ok(FrameList::new());
        }
        let pa = self.alloc_pages(count)?;
        FrameList::contiguous(pa, count).inspect_err(|_| self.free_pages(pa, count))
    }

    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
    ) -> Result<(PhysicalAddress, FrameList), PmmError> {
        #[allow(clippy::cast_possible_truncation)]
        let align_log2 = align_log2.max(PAGE_SHIFT as u8);
        if count == 0 || align_log2 >= 63 {
            return Err(PmmError::InvalidArgument);
        }
        let align = 1_u64 << align_log2;
        let step = usize::try_from(align >> PAGE_SHIFT).map_err(|_| PmmError::InvalidArgument)?;

        let pa = self
            .arenas()
            .find_map(|a| a.alloc_run(count, a.first_aligned_index(align)?, step))
            .ok_or(PmmError::NoMemory)?;
        let list = FrameList::contiguous(pa, count).inspect_err(|_| self.free_pages(pa, count))?;
        Ok((pa, list))
    }

    fn alloc_at(&self, pa: PhysicalAddress, count: usize) -> Result<FrameList, PmmError> {
        let list = FrameList::contiguous(pa, count)?;
        self.alloc_specific(pa, count)?;
        Ok(list)
    }

    /// # Panics
    /// If any page is foreign, already free, or listed twice. The bitmaps are
    /// left untouched then.
    fn free_frames(&self, frames: FrameList) -> usize {
        if let Some(pa) = frames.iter().find(|&pa| self.arena_of(pa).is_none()) {
            error!("novm: free of {pa} outside every arena");
            panic!("free of {pa} outside every arena");
        }

        for (i, pa) in frames.iter().enumerate() {
            if self.arena_of(pa).is_some_and(|arena| arena.release_page(pa)) {
                continue;
            }
            for done in frames.iter().take(i) {
                if let Some(arena) = self.arena_of(done) {
                    arena.claim_page(done);
                }
            }
            error!("novm: double free of {pa}");
            panic!("double free of page {pa}");
        }
        debug!("novm: freed {} listed pages", frames.len());
        frames.len()
    }

    fn free_count(&self) -> usize {
        self.arenas().map(FlatArena::free_count).sum()
    }
}
