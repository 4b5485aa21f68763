use crate::arena::{Arena, ArenaFlags};
use crate::frame::FrameInfo;
use crate::{FrameAllocator, FrameList, FrameRefs, PmmError};
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::MAX_ARENAS;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use kernel_sync::{SpinMutex, SyncOnceCell};
use log::{debug, error, info, warn};

/// Largest supported alignment for contiguous runs, as a power of two.
const MAX_ALIGN_LOG2: u8 = 63;

/// The physical frame allocator: a fixed registry of [`Arena`]s.
///
/// Arenas are only ever added, never removed, so a registered arena can be
/// borrowed for the allocator's lifetime without holding any lock. Each arena
/// serializes its own frame table.
pub struct PhysicalFrameAllocator {
    arenas: [SyncOnceCell<Arena>; MAX_ARENAS],
    registered: AtomicUsize,
    /// Serializes registration (overlap check plus slot publication).
    registry: SpinMutex<()>,
}

impl PhysicalFrameAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arenas: [const { SyncOnceCell::new() }; MAX_ARENAS],
            registered: AtomicUsize::new(0),
            registry: SpinMutex::new(()),
        }
    }

    /// Register `[base, base + size)` as allocatable RAM.
    ///
    /// # Errors
    /// - [`PmmError::InvalidArgument`] for an empty, misaligned, wrapping or
    ///   overlapping range.
    /// - [`PmmError::NoMemory`] if the registry is full or the frame table
    ///   cannot be allocated.
    pub fn add_arena(
        &self,
        name: &'static str,
        base: PhysicalAddress,
        size: u64,
        flags: ArenaFlags,
    ) -> Result<(), PmmError> {
        if size == 0 || !base.is_page_aligned() || !size.is_multiple_of(PAGE_SIZE) {
            warn!("pmm: rejecting arena '{name}' at {base} size {size:#x}: empty or misaligned");
            return Err(PmmError::InvalidArgument);
        }
        if base.as_u64().checked_add(size - 1).is_none() {
            warn!("pmm: rejecting arena '{name}' at {base} size {size:#x}: wraps");
            return Err(PmmError::InvalidArgument);
        }

        let _registry = self.registry.lock();

        if let Some(other) = self.arenas().find(|a| a.overlaps(base, size)) {
            warn!(
                "pmm: rejecting arena '{name}' at {base} size {size:#x}: overlaps '{}'",
                other.name()
            );
            return Err(PmmError::InvalidArgument);
        }

        let slot = self.registered.load(Ordering::Acquire);
        if slot >= MAX_ARENAS {
            warn!("pmm: arena registry full, dropping '{name}'");
            return Err(PmmError::NoMemory);
        }

        let arena = Arena::new(name, base, size, flags)?;
        let frames = arena.frame_count();
        if self.arenas[slot].set(arena).is_err() {
            error!("pmm: arena slot {slot} already occupied");
            return Err(PmmError::InvalidArgument);
        }
        self.registered.store(slot + 1, Ordering::Release);

        info!("pmm: arena '{name}' {base}..{} ({frames} frames, {flags:?})", base + size);
        Ok(())
    }

    /// Registered arenas, in registration order.
    pub fn arenas(&self) -> impl Iterator<Item = &Arena> + '_ {
        let n = self.registered.load(Ordering::Acquire);
        self.arenas[..n].iter().filter_map(SyncOnceCell::get)
    }

    /// Metadata of the frame containing `pa`, if any arena owns it.
    #[must_use]
    pub fn frame_info(&self, pa: PhysicalAddress) -> Option<FrameInfo> {
        self.arena_of(pa)?.frame_info(pa)
    }

    /// Number of frames managed across all arenas.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.arenas().map(Arena::frame_count).sum()
    }

    /// Dump every arena and its free runs at `info` level.
    pub fn log_arenas(&self) {
        info!(
            "pmm: {} arenas, {} of {} frames free",
            self.registered.load(Ordering::Acquire),
            self.free_count(),
            self.total_frames()
        );
        for arena in self.arenas() {
            arena.log_state();
        }
    }

    fn arena_of(&self, pa: PhysicalAddress) -> Option<&Arena> {
        self.arenas().find(|a| a.contains(pa))
    }

    fn owning_arena(&self, pa: PhysicalAddress) -> &Arena {
        self.arena_of(pa).unwrap_or_else(|| {
            error!("pmm: {pa} belongs to no arena");
            panic!("frame {pa} belongs to no arena");
        })
    }

    /// First contiguous run of `count` frames in an arena accepted by `pick`.
    fn take_run(
        &self,
        count: usize,
        align_log2: u8,
        pick: impl Fn(&Arena) -> bool,
    ) -> Result<(PhysicalAddress, FrameList), PmmError> {
        #[allow(clippy::cast_possible_truncation)]
        let align_log2 = align_log2.max(PAGE_SHIFT as u8);
        if count == 0 || align_log2 >= MAX_ALIGN_LOG2 {
            return Err(PmmError::InvalidArgument);
        }

        // Reserve the list first so a successful take cannot fail afterwards.
        let mut list = FrameList::with_capacity(count)?;

        for arena in self.arenas().filter(|&a| pick(a)) {
            if let Some(base) = arena.take_contiguous(count, u32::from(align_log2)) {
                for i in 0..count as u64 {
                    list.push_reserved(base + i * PAGE_SIZE);
                }
                debug!("pmm: contiguous run of {count} frames at {base} from '{}'", arena.name());
                return Ok((base, list));
            }
        }

        debug!("pmm: no contiguous run of {count} frames aligned to 2^{align_log2}");
        Err(PmmError::NoMemory)
    }
}

impl Default for PhysicalFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for PhysicalFrameAllocator {
    fn alloc_frames(&self, count: usize) -> Result<FrameList, PmmError> {
        let mut list = FrameList::with_capacity(count)?;
        if count == 0 {
            return Ok(list);
        }

        let mut remaining = count;
        for arena in self.arenas() {
            remaining -= arena.take(remaining, &mut list);
            if remaining == 0 {
                debug!("pmm: allocated {count} frames");
                return Ok(list);
            }
        }

        debug!("pmm: only {} of {count} frames available", list.len());
        self.free_frames(list);
        Err(PmmError::NoMemory)
    }

    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
    ) -> Result<(PhysicalAddress, FrameList), PmmError> {
        self.take_run(count, align_log2, |_| true)
    }

    /// Only arenas registered with [`ArenaFlags::kmap`] are searched.
    fn alloc_kmapped(&self, count: usize) -> Result<(PhysicalAddress, FrameList), PmmError> {
        self.take_run(count, 0, |arena| arena.flags().kmap())
    }

    fn alloc_at(&self, pa: PhysicalAddress, count: usize) -> Result<FrameList, PmmError> {
        if !pa.is_page_aligned() {
            return Err(PmmError::InvalidArgument);
        }
        if count == 0 {
            return Ok(FrameList::new());
        }

        let arena = self
            .arenas()
            .find(|a| a.contains_range(pa, count))
            .ok_or(PmmError::NoMemory)?;

        let list = FrameList::contiguous(pa, count)?;
        arena.take_range(pa, count)?;
        debug!("pmm: claimed {count} frames at {pa}");
        Ok(list)
    }

    fn free_frames(&self, frames: FrameList) -> usize {
        // Validate ownership up front so a bad list leaves every arena intact.
        for pa in &frames {
            self.owning_arena(pa);
        }

        let mut freed = 0;
        for arena in self.arenas() {
            freed += arena.give_back(frames.iter().filter(|&pa| arena.contains(pa)));
        }
        debug_assert_eq!(freed, frames.len());
        freed
    }

    fn free_count(&self) -> usize {
        self.arenas().map(Arena::free_count).sum()
    }
}

impl FrameRefs for PhysicalFrameAllocator {
    fn retain_frame(&self, pa: PhysicalAddress) -> u32 {
        self.owning_arena(pa).adjust_refs(pa, true)
    }

    fn release_frame(&self, pa: PhysicalAddress) -> u32 {
        self.owning_arena(pa).adjust_refs(pa, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmm_with(arenas: &[(u64, u64)]) -> PhysicalFrameAllocator {
        let pmm = PhysicalFrameAllocator::new();
        for &(base, pages) in arenas {
            pmm.add_arena("ram", PhysicalAddress::new(base), pages * PAGE_SIZE, ArenaFlags::new())
                .unwrap();
        }
        pmm
    }

    #[test]
    fn rejects_bad_ranges() {
        let pmm = pmm_with(&[(0x1000_0000, 16)]);
        let flags = ArenaFlags::new();
        assert_eq!(
            pmm.add_arena("empty", PhysicalAddress::new(0x2000_0000), 0, flags),
            Err(PmmError::InvalidArgument)
        );
        assert_eq!(
            pmm.add_arena("odd", PhysicalAddress::new(0x2000_0800), PAGE_SIZE, flags),
            Err(PmmError::InvalidArgument)
        );
        assert_eq!(
            pmm.add_arena("wrap", PhysicalAddress::new(u64::MAX - 0xFFF), 2 * PAGE_SIZE, flags),
            Err(PmmError::InvalidArgument)
        );
        assert_eq!(
            pmm.add_arena("overlap", PhysicalAddress::new(0x1000_F000), 2 * PAGE_SIZE, flags),
            Err(PmmError::InvalidArgument)
        );
        assert_eq!(pmm.arenas().count(), 1);
    }

    #[test]
    fn registry_capacity_is_bounded() {
        let pmm = PhysicalFrameAllocator::new();
        for i in 0..MAX_ARENAS as u64 {
            pmm.add_arena("ram", PhysicalAddress::new(i * 0x10_0000), PAGE_SIZE, ArenaFlags::new())
                .unwrap();
        }
        assert_eq!(
            pmm.add_arena("extra", PhysicalAddress::new(0x1_0000_0000), PAGE_SIZE, ArenaFlags::new()),
            Err(PmmError::NoMemory)
        );
        assert_eq!(pmm.total_frames(), MAX_ARENAS);
    }

    #[test]
    fn allocation_spans_arenas_in_registration_order() {
        let pmm = pmm_with(&[(0x2000_0000, 2), (0x1000_0000, 2)]);
        let frames = pmm.alloc_frames(3).unwrap();
        assert_eq!(
            frames.as_slice(),
            [
                PhysicalAddress::new(0x2000_0000),
                PhysicalAddress::new(0x2000_1000),
                PhysicalAddress::new(0x1000_0000),
            ]
        );
        assert_eq!(pmm.free_count(), 1);
        assert_eq!(pmm.free_frames(frames), 3);
        assert_eq!(pmm.free_count(), 4);
    }

    #[test]
    fn zero_count_requests() {
        let pmm = pmm_with(&[(0x1000_0000, 4)]);
        assert!(pmm.alloc_frames(0).unwrap().is_empty());
        assert_eq!(pmm.alloc_contiguous(0, 0), Err(PmmError::InvalidArgument));
        assert_eq!(pmm.alloc_contiguous(1, 63), Err(PmmError::InvalidArgument));
        assert_eq!(pmm.free_count(), 4);
    }

    #[test]
    fn reference_counts_route_to_the_owning_arena() {
        let pmm = pmm_with(&[(0x1000_0000, 2), (0x3000_0000, 2)]);
        let frames = pmm.alloc_at(PhysicalAddress::new(0x3000_1000), 1).unwrap();
        let pa = frames.first().unwrap();
        assert_eq!(pmm.retain_frame(pa), 1);
        assert_eq!(pmm.frame_info(pa).unwrap().ref_count, 1);
        assert_eq!(pmm.release_frame(pa), 0);
        pmm.free_frames(frames);
        assert!(!pmm.frame_info(pa).unwrap().in_use);
        assert_eq!(pmm.frame_info(PhysicalAddress::new(0x5000_0000)), None);
    }

    #[test]
    #[should_panic(expected = "belongs to no arena")]
    fn freeing_a_foreign_frame_panics() {
        let pmm = pmm_with(&[(0x1000_0000, 2)]);
        pmm.free_frames(FrameList::from_iter([PhysicalAddress::new(0x9000_0000)]));
    }
}
