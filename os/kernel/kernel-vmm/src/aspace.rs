use crate::region::{RegionInfo, RegionList};
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{MutexGuard, RawTicket, TicketMutex};
use kernel_vmem::{ArchAspace, AspaceKind};
use log::info;

/// State guarded by the address-space lock.
pub(crate) struct AspaceInner {
    pub(crate) regions: RegionList,
    pub(crate) arch: ArchAspace,
}

/// A set of regions and the page tables that map them.
///
/// Created by [`Vmm::create_address_space`](crate::Vmm::create_address_space)
/// and torn down by [`Vmm::free_address_space`](crate::Vmm::free_address_space).
/// One ticket lock serializes region-list edits and page-table walks on it.
pub struct AddressSpace {
    name: &'static str,
    kind: AspaceKind,
    base: VirtualAddress,
    size: u64,
    inner: TicketMutex<AspaceInner>,
}

impl AddressSpace {
    pub(crate) fn new(name: &'static str, arch: ArchAspace) -> Self {
        Self {
            name,
            kind: arch.kind(),
            base: arch.base(),
            size: arch.size(),
            inner: TicketMutex::new(AspaceInner {
                regions: RegionList::new(),
                arch,
            }),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn kind(&self) -> AspaceKind {
        self.kind
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether `[va, va + len)` lies inside the address space.
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress, len: u64) -> bool {
        va.range_within(len, self.base, self.size)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AspaceInner, RawTicket> {
        self.inner.lock()
    }

    pub(crate) fn into_inner(self) -> AspaceInner {
        self.inner.into_inner()
    }

    /// Snapshot of the region list, in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.lock().regions.iter().map(|r| r.info()).collect()
    }

    /// The region covering `va`, if any.
    #[must_use]
    pub fn region_at(&self, va: VirtualAddress) -> Option<RegionInfo> {
        let inner = self.lock();
        let idx = inner.regions.position_covering(va)?;
        inner.regions.get(idx).map(|r| r.info())
    }

    /// Dump the address space and its regions at `info` level.
    pub fn log(&self) {
        let inner = self.lock();
        info!(
            "vmm: address space '{}' {}..{:#x} {:?} asid {:?}, {} regions",
            self.name,
            self.base,
            self.base.as_u64() + (self.size - 1),
            self.kind,
            inner.arch.asid(),
            inner.regions.len()
        );
        for region in inner.regions.iter() {
            info!("vmm:   {}", region.info());
        }
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
