use crate::frame::{Frame, FrameInfo, FrameState, MAX_REF_COUNT};
use crate::free_list::{FreeList, NIL};
use crate::{FrameList, PmmError};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_up};
use kernel_sync::TicketMutex;
use log::{error, info};

/// Properties of an arena, given at registration.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ArenaFlags {
    /// The arena is already covered by the kernel's physmap.
    pub kmap: bool,

    #[bits(31)]
    __reserved: u32,
}

/// A registered, contiguous range of physical memory.
///
/// The range is immutable; only the frame table and free list change, and
/// only under the arena's own lock.
pub struct Arena {
    name: &'static str,
    base: PhysicalAddress,
    size: u64,
    flags: ArenaFlags,
    state: TicketMutex<ArenaState>,
}

struct ArenaState {
    frames: Vec<Frame>,
    free: FreeList,
}

impl Arena {
    /// Build an arena whose frames are all free, linked in ascending order.
    pub(crate) fn new(
        name: &'static str,
        base: PhysicalAddress,
        size: u64,
        flags: ArenaFlags,
    ) -> Result<Self, PmmError> {
        let count = usize::try_from(size >> PAGE_SHIFT).map_err(|_| PmmError::InvalidArgument)?;
        if count >= NIL as usize {
            return Err(PmmError::InvalidArgument);
        }

        let mut frames = Vec::new();
        frames
            .try_reserve_exact(count)
            .map_err(|_| PmmError::NoMemory)?;
        frames.resize(count, Frame::free());

        let mut free = FreeList::new();
        for idx in 0..count {
            #[allow(clippy::cast_possible_truncation)]
            free.push_back(&mut frames, idx as u32);
        }

        Ok(Self {
            name,
            base,
            size,
            flags,
            state: TicketMutex::new(ArenaState { frames, free }),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn flags(&self) -> ArenaFlags {
        self.flags
    }

    /// Number of frames the arena manages.
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        (self.size >> PAGE_SHIFT) as usize
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && pa - self.base < self.size
    }

    /// Whether `[pa, pa + count pages)` lies entirely inside the arena.
    #[must_use]
    pub fn contains_range(&self, pa: PhysicalAddress, count: usize) -> bool {
        self.contains(pa) && (count as u64) <= (self.size - (pa - self.base)) >> PAGE_SHIFT
    }

    /// Whether `[base, base + size)` intersects this arena.
    #[must_use]
    pub fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        base.as_u64() <= self.base.as_u64() + (self.size - 1)
            && self.base.as_u64() <= base.as_u64() + (size - 1)
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// The free list as it is linked, head first.
    ///
    /// Its length always equals [`free_count`](Self::free_count).
    #[must_use]
    pub fn free_list(&self) -> Vec<PhysicalAddress> {
        let state = self.state.lock();
        state
            .free
            .iter(&state.frames)
            .map(|idx| self.address_of(idx as usize))
            .collect()
    }

    #[must_use]
    pub fn frame_info(&self, pa: PhysicalAddress) -> Option<FrameInfo> {
        if !self.contains(pa) {
            return None;
        }
        let frame = self.state.lock().frames[self.index_of(pa)];
        Some(FrameInfo {
            address: pa.page_base(),
            in_use: frame.state.in_use(),
            ref_count: frame.state.ref_count(),
        })
    }

    /// Pop up to `max` frames off the free list into `out`.
    ///
    /// `out` must have spare capacity for `max` entries. Returns the number of
    /// frames taken.
    pub(crate) fn take(&self, max: usize, out: &mut FrameList) -> usize {
        let mut state = self.state.lock();
        let ArenaState { frames, free } = &mut *state;

        let mut taken = 0;
        while taken < max {
            let Some(idx) = free.pop_front(frames) else {
                break;
            };
            frames[idx as usize].state = FrameState::new().with_in_use(true);
            out.push_reserved(self.address_of(idx as usize));
            taken += 1;
        }
        taken
    }

    /// First-fit search for `count` free frames starting at a
    /// `2^align_log2`-aligned physical address.
    pub(crate) fn take_contiguous(&self, count: usize, align_log2: u32) -> Option<PhysicalAddress> {
        let align = 1_u64 << align_log2;
        let first = (align_up(self.base.as_u64(), align)? - self.base.as_u64()) >> PAGE_SHIFT;
        let first = usize::try_from(first).ok()?;
        let step = usize::try_from(align >> PAGE_SHIFT).ok()?.max(1);

        let mut state = self.state.lock();
        let ArenaState { frames, free } = &mut *state;

        let mut start = first;
        while start.checked_add(count)? <= frames.len() {
            match (start..start + count).find(|&i| frames[i].state.in_use()) {
                None => {
                    for i in start..start + count {
                        #[allow(clippy::cast_possible_truncation)]
                        free.remove(frames, i as u32);
                        frames[i].state = FrameState::new().with_in_use(true);
                    }
                    return Some(self.address_of(start));
                }
                // Resume at the first aligned candidate past the busy frame.
                Some(busy) => start = first + (busy + 1 - first).div_ceil(step) * step,
            }
        }
        None
    }

    /// Claim exactly `[pa, pa + count pages)`; nothing is taken on collision.
    pub(crate) fn take_range(&self, pa: PhysicalAddress, count: usize) -> Result<(), PmmError> {
        debug_assert!(self.contains_range(pa, count));
        let first = self.index_of(pa);

        let mut state = self.state.lock();
        let ArenaState { frames, free } = &mut *state;

        if frames[first..first + count].iter().any(|f| f.state.in_use()) {
            return Err(PmmError::AlreadyAllocated);
        }
        for i in first..first + count {
            #[allow(clippy::cast_possible_truncation)]
            free.remove(frames, i as u32);
            frames[i].state = FrameState::new().with_in_use(true);
        }
        Ok(())
    }

    /// Put frames back on the tail of the free list, clearing their metadata.
    ///
    /// # Panics
    /// If any of them is already free.
    pub(crate) fn give_back(&self, pas: impl Iterator<Item = PhysicalAddress>) -> usize {
        let mut state = self.state.lock();
        let ArenaState { frames, free } = &mut *state;

        let mut freed = 0;
        for pa in pas {
            let idx = self.index_of(pa);
            if !frames[idx].state.in_use() {
                error!("pmm: double free of {pa} in arena '{}'", self.name);
                panic!("double free of frame {pa} in arena '{}'", self.name);
            }
            frames[idx].state = FrameState::new();
            #[allow(clippy::cast_possible_truncation)]
            free.push_back(frames, idx as u32);
            freed += 1;
        }
        freed
    }

    pub(crate) fn adjust_refs(&self, pa: PhysicalAddress, increment: bool) -> u32 {
        let idx = self.index_of(pa);
        let mut state = self.state.lock();
        let frame = &mut state.frames[idx];

        if !frame.state.in_use() {
            error!("pmm: reference count change on free frame {pa}");
            panic!("reference count change on free frame {pa}");
        }
        let count = frame.state.ref_count();
        let count = if increment {
            assert!(count < MAX_REF_COUNT, "reference count overflow on frame {pa}");
            count + 1
        } else {
            assert!(count > 0, "reference count underflow on frame {pa}");
            count - 1
        };
        frame.state.set_ref_count(count);
        count
    }

    /// Log the arena and its free runs.
    pub fn log_state(&self) {
        let state = self.state.lock();
        info!(
            "arena '{}': {}..{} flags {:?}, {} of {} frames free",
            self.name,
            self.base,
            self.base + self.size,
            self.flags,
            state.free.len(),
            state.frames.len()
        );

        let mut run_start = None;
        for (i, frame) in state.frames.iter().enumerate() {
            match (frame.state.in_use(), run_start) {
                (false, None) => run_start = Some(i),
                (true, Some(s)) => {
                    info!("  free {}..{}", self.address_of(s), self.address_of(i));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            info!("  free {}..{}", self.address_of(s), self.base + self.size);
        }
    }

    #[inline]
    fn index_of(&self, pa: PhysicalAddress) -> usize {
        debug_assert!(self.contains(pa));
        ((pa - self.base) >> PAGE_SHIFT) as usize
    }

    #[inline]
    fn address_of(&self, idx: usize) -> PhysicalAddress {
        self.base + idx as u64 * PAGE_SIZE
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
