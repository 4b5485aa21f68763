use crate::{MapError, MmuFlags, QueryError};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Which half of the address space an [`ArchAspace`] translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspaceKind {
    /// The permanent kernel address space; its mappings are global.
    Kernel,
    /// A per-context user address space.
    User,
}

/// Architecture state of one address space: its root table, ASID and window.
///
/// Created by [`Mmu::init_aspace`] and consumed by [`Mmu::destroy_aspace`];
/// it is deliberately not `Clone`, so the root has exactly one owner.
#[derive(Debug)]
pub struct ArchAspace {
    pub(crate) root: PhysicalAddress,
    pub(crate) asid: Option<u16>,
    pub(crate) base: VirtualAddress,
    pub(crate) size: u64,
    pub(crate) kind: AspaceKind,
}

impl ArchAspace {
    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn asid(&self) -> Option<u16> {
        self.asid
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> AspaceKind {
        self.kind
    }

    /// Whether `[va, va + len)` lies inside this address space's window.
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress, len: u64) -> bool {
        va.range_within(len, self.base, self.size)
    }
}

/// The page-table capability the address-space manager is written against.
///
/// One implementation exists per [`PageTableFormat`](crate::PageTableFormat)
/// ([`PageTableWalker`](crate::PageTableWalker)); callers never branch on the
/// architecture.
pub trait Mmu {
    /// Create the architecture state for a window `[base, base + size)`.
    ///
    /// The kernel flavor adopts the boot root and may only be created once;
    /// the user flavor allocates a fresh root.
    ///
    /// # Errors
    /// [`MapError::NoMemory`] if a root or shared table cannot be allocated,
    /// [`MapError::InvalidArgument`] for a second kernel address space or a
    /// user address space created before the kernel one.
    fn init_aspace(
        &self,
        base: VirtualAddress,
        size: u64,
        kind: AspaceKind,
    ) -> Result<ArchAspace, MapError>;

    /// Free every table of a user address space and release its ASID.
    ///
    /// # Panics
    /// For the kernel address space.
    fn destroy_aspace(&self, aspace: ArchAspace);

    /// Map `count` pages starting at `va` to the physical pages starting at
    /// `pa`. Either every page is mapped or none is.
    ///
    /// # Errors
    /// [`MapError::NoMemory`] if an intermediate table cannot be allocated,
    /// [`MapError::InvalidArgument`] for unaligned addresses.
    ///
    /// # Panics
    /// If the range leaves the address space or any page is already mapped.
    fn map(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> Result<(), MapError>;

    /// Unmap `count` pages starting at `va`, skipping holes, and return the
    /// number of pages actually unmapped.
    ///
    /// # Panics
    /// If the range leaves the address space.
    fn unmap(&self, aspace: &ArchAspace, va: VirtualAddress, count: usize) -> usize;

    /// Translate `va`.
    ///
    /// # Errors
    /// [`QueryError::NotFound`] if nothing is mapped there,
    /// [`QueryError::OutOfRange`] if `va` is outside the address space.
    fn query(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
    ) -> Result<(PhysicalAddress, MmuFlags), QueryError>;

    /// Make `aspace` the current translation context, or restore the
    /// kernel-only context for `None`.
    ///
    /// # Safety
    /// The running code and its stack must stay mapped in the new context.
    unsafe fn context_switch(&self, aspace: Option<&ArchAspace>);
}

impl<T: Mmu + ?Sized> Mmu for &T {
    fn init_aspace(
        &self,
        base: VirtualAddress,
        size: u64,
        kind: AspaceKind,
    ) -> Result<ArchAspace, MapError> {
        (**self).init_aspace(base, size, kind)
    }

    fn destroy_aspace(&self, aspace: ArchAspace) {
        (**self).destroy_aspace(aspace);
    }

    fn map(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> Result<(), MapError> {
        (**self).map(aspace, va, pa, count, flags)
    }

    fn unmap(&self, aspace: &ArchAspace, va: VirtualAddress, count: usize) -> usize {
        (**self).unmap(aspace, va, count)
    }

    fn query(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
    ) -> Result<(PhysicalAddress, MmuFlags), QueryError> {
        (**self).query(aspace, va)
    }

    unsafe fn context_switch(&self, aspace: Option<&ArchAspace>) {
        unsafe { (**self).context_switch(aspace) }
    }
}
