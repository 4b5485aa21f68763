use crate::PmmError;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// An owned set of allocated frames.
///
/// Allocation moves frames out of their arenas into a `FrameList`; handing the
/// list to [`FrameAllocator::free_frames`](crate::FrameAllocator::free_frames)
/// moves them back. The list is deliberately not `Clone`: a frame has exactly
/// one owner.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FrameList(Vec<PhysicalAddress>);

impl FrameList {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// An empty list with room for `count` frames.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if the kernel heap cannot hold the list itself.
    pub fn with_capacity(count: usize) -> Result<Self, PmmError> {
        let mut v = Vec::new();
        v.try_reserve_exact(count).map_err(|_| PmmError::NoMemory)?;
        Ok(Self(v))
    }

    /// The frames of the contiguous run `[base, base + count * PAGE_SIZE)`.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if the kernel heap cannot hold the list itself.
    pub fn contiguous(base: PhysicalAddress, count: usize) -> Result<Self, PmmError> {
        let mut list = Self::with_capacity(count)?;
        list.0
            .extend((0..count as u64).map(|i| base + i * PAGE_SIZE));
        Ok(list)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<PhysicalAddress> {
        self.0.first().copied()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[PhysicalAddress] {
        &self.0
    }

    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = PhysicalAddress> + '_ {
        self.0.iter().copied()
    }

    /// Append a frame. The caller transfers ownership of `pa` to the list.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if the list cannot grow.
    pub fn push(&mut self, pa: PhysicalAddress) -> Result<(), PmmError> {
        self.0.try_reserve(1).map_err(|_| PmmError::NoMemory)?;
        self.0.push(pa);
        Ok(())
    }

    /// Move every frame of `other` into `self`.
    ///
    /// # Errors
    /// [`PmmError::NoMemory`] if the list cannot grow; `other` is handed back
    /// untouched in that case.
    pub fn append(&mut self, mut other: Self) -> Result<(), (PmmError, Self)> {
        if self.0.try_reserve(other.len()).is_err() {
            return Err((PmmError::NoMemory, other));
        }
        self.0.append(&mut other.0);
        Ok(())
    }

    /// Whether the frames form one ascending, gap-free run.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.0
            .windows(2)
            .all(|w| w[0].checked_add(PAGE_SIZE) == Some(w[1]))
    }

    pub(crate) fn push_reserved(&mut self, pa: PhysicalAddress) {
        debug_assert!(self.0.len() < self.0.capacity());
        self.0.push(pa);
    }
}

impl FromIterator<PhysicalAddress> for FrameList {
    fn from_iter<I: IntoIterator<Item = PhysicalAddress>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for FrameList {
    type Item = PhysicalAddress;
    type IntoIter = alloc::vec::IntoIter<PhysicalAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FrameList {
    type Item = PhysicalAddress;
    type IntoIter = core::iter::Copied<core::slice::Iter<'a, PhysicalAddress>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}
