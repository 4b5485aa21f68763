//! Address-space identifier allocation.
//!
//! ASID 0 is reserved: it tags the kernel-only context on single-root MMUs and
//! the boot tables everywhere, so it is never handed to a user address space.

use alloc::vec::Vec;
use kernel_sync::SpinMutex;
use log::warn;

struct PoolState {
    /// One bit per ASID, set while in use.
    used: Vec<u64>,
    /// Where the next search starts, so recently freed ASIDs are reused last.
    next: usize,
}

/// A bitmap of `2^bits` ASIDs.
pub struct AsidPool {
    count: usize,
    state: SpinMutex<PoolState>,
}

impl AsidPool {
    /// A pool of `2^bits` identifiers, or `None` if `bits` is zero or the
    /// bitmap cannot be allocated.
    #[must_use]
    pub fn new(bits: u32) -> Option<Self> {
        if bits == 0 || bits > 16 {
            return None;
        }
        let count = 1_usize << bits;
        let words = count.div_ceil(64);
        let mut used = Vec::new();
        used.try_reserve_exact(words).ok()?;
        used.resize(words, 0);
        used[0] |= 1;
        Some(Self {
            count,
            state: SpinMutex::new(PoolState { used, next: 1 }),
        })
    }

    /// Number of identifiers, the reserved one included.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.count
    }

    /// Take the next free identifier, scanning cyclically.
    pub fn alloc(&self) -> Option<u16> {
        let mut state = self.state.lock();
        let start = state.next;
        for step in 0..self.count {
            let asid = (start + step) % self.count;
            let (word, bit) = (asid / 64, asid % 64);
            if state.used[word] & (1 << bit) == 0 {
                state.used[word] |= 1 << bit;
                state.next = (asid + 1) % self.count;
                #[allow(clippy::cast_possible_truncation)]
                return Some(asid as u16);
            }
        }
        warn!("all {} ASIDs in use; address space runs untagged", self.count);
        None
    }

    /// Return `asid` to the pool.
    ///
    /// # Panics
    /// If `asid` is reserved, out of range, or not allocated.
    pub fn release(&self, asid: u16) {
        let asid = usize::from(asid);
        assert!(asid != 0 && asid < self.count, "ASID {asid} out of range");
        let mut state = self.state.lock();
        let (word, bit) = (asid / 64, asid % 64);
        assert!(state.used[word] & (1 << bit) != 0, "ASID {asid} released twice");
        state.used[word] &= !(1 << bit);
    }

    /// Number of identifiers currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        let set: u32 = state.used.iter().map(|w| w.count_ones()).sum();
        set as usize - 1
    }
}

impl core::fmt::Debug for AsidPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsidPool")
            .field("capacity", &self.count)
            .field("in_use", &self.in_use())
            .finish()
    }
}
