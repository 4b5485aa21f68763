use crate::VmmError;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::FrameList;
use kernel_memory_addresses::{VirtualAddress, align_up};
use kernel_vmem::MmuFlags;

/// What backs a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Frames taken from the frame allocator; returned when the region goes.
    Backed,
    /// Address range kept free; nothing is mapped by the manager.
    Reserved,
    /// Caller-supplied physical memory such as device registers.
    Physical,
}

/// A named, page-aligned range of an address space.
pub struct Region {
    pub(crate) name: &'static str,
    pub(crate) base: VirtualAddress,
    pub(crate) size: u64,
    pub(crate) kind: RegionKind,
    pub(crate) flags: MmuFlags,
    pub(crate) frames: FrameList,
}

impl Region {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub const fn flags(&self) -> MmuFlags {
        self.flags
    }

    /// The frames this region owns (empty unless [`RegionKind::Backed`]).
    #[must_use]
    pub const fn frames(&self) -> &FrameList {
        &self.frames
    }

    /// Last byte of the region.
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.base.as_u64() + (self.size - 1)
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() <= self.last()
    }

    #[must_use]
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            name: self.name,
            base: self.base,
            size: self.size,
            kind: self.kind,
            flags: self.flags,
            frames: self.frames.len(),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.info(), f)
    }
}

/// A copy of a region's bookkeeping, safe to hold without the address-space
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub name: &'static str,
    pub base: VirtualAddress,
    pub size: u64,
    pub kind: RegionKind,
    pub flags: MmuFlags,
    /// Number of owned frames.
    pub frames: usize,
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region '{}' {}..{:#x} {:?} {:?}, {} frames",
            self.name,
            self.base,
            self.base.as_u64() + (self.size - 1),
            self.kind,
            self.flags,
            self.frames
        )
    }
}

/// The regions of one address space, sorted by base and pairwise disjoint.
#[derive(Debug, Default)]
pub(crate) struct RegionList(Vec<Region>);

impl RegionList {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Make room for one more region so that [`insert`](Self::insert) cannot
    /// fail after mappings were made.
    pub fn reserve_one(&mut self) -> Result<(), VmmError> {
        self.0.try_reserve(1).map_err(|_| VmmError::NoMemory)
    }

    /// First fit: the lowest `align`-aligned address in `[base, base + limit)`
    /// where `size` bytes fit between existing regions.
    pub fn find_gap(
        &self,
        base: VirtualAddress,
        limit: u64,
        size: u64,
        align: u64,
    ) -> Option<VirtualAddress> {
        // Offsets from `base` keep the arithmetic clear of the top of the
        // address space.
        let fits = |gap_start: u64, gap_end: u64| -> Option<u64> {
            let candidate = align_up(base.as_u64().checked_add(gap_start)?, align)? - base.as_u64();
            (candidate.checked_add(size)? <= gap_end).then_some(candidate)
        };

        let mut cursor = 0;
        for region in &self.0 {
            let start = region.base - base;
            if let Some(offset) = fits(cursor, start) {
                return Some(base + offset);
            }
            cursor = start + region.size;
        }
        fits(cursor, limit).map(|offset| base + offset)
    }

    /// Whether `[va, va + size)` intersects any region.
    pub fn overlaps(&self, va: VirtualAddress, size: u64) -> bool {
        let last = va.as_u64() + (size - 1);
        self.0
            .iter()
            .any(|r| r.base.as_u64() <= last && va.as_u64() <= r.last())
    }

    /// Insert keeping the list sorted. The caller checked for overlap and
    /// called [`reserve_one`](Self::reserve_one).
    pub fn insert(&mut self, region: Region) {
        debug_assert!(!self.overlaps(region.base, region.size));
        let at = self.0.partition_point(|r| r.base < region.base);
        self.0.insert(at, region);
    }

    pub fn position_covering(&self, va: VirtualAddress) -> Option<usize> {
        self.0.iter().position(|r| r.contains(va))
    }

    pub fn get(&self, idx: usize) -> Option<&Region> {
        self.0.get(idx)
    }

    pub fn remove(&mut self, idx: usize) -> Region {
        self.0.remove(idx)
    }

    /// Remove the lowest region, for tearing an address space down.
    pub fn pop_first(&mut self) -> Option<Region> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.remove(0))
        }
    }
}
