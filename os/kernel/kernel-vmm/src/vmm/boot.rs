use super::Vmm;
use crate::{AddressSpace, VmmError};
use kernel_alloc::{FrameAllocator, FrameList, PmmError};
use kernel_info::InitialMapping;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up, pages_to_bytes,
};
use kernel_vmem::Mmu;
use log::{debug, info, warn};

impl<T: Mmu, A: FrameAllocator> Vmm<'_, T, A> {
    /// Where `pa` appears in the kernel's physmap.
    #[must_use]
    pub const fn paddr_to_kvaddr(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.layout.phys_to_kvirt(pa)
    }

    /// The address space that translates `vaddr`: the kernel one for kernel
    /// addresses, `current` for user addresses it covers.
    #[must_use]
    pub fn vaddr_to_aspace<'s>(
        &'s self,
        vaddr: VirtualAddress,
        current: Option<&'s AddressSpace>,
    ) -> Option<&'s AddressSpace> {
        if self.layout.is_kernel_range(vaddr, 1) {
            Some(&self.kernel)
        } else if self.layout.is_user_range(vaddr, 1) {
            current.filter(|aspace| aspace.contains(vaddr, 1))
        } else {
            None
        }
    }

    /// The physical address behind `vaddr` in the address space
    /// [`vaddr_to_aspace`](Self::vaddr_to_aspace) picks.
    #[must_use]
    pub fn vaddr_to_paddr(
        &self,
        vaddr: VirtualAddress,
        current: Option<&AddressSpace>,
    ) -> Option<PhysicalAddress> {
        let aspace = self.vaddr_to_aspace(vaddr, current)?;
        self.query(aspace, vaddr).ok().map(|(pa, _)| pa)
    }

    /// Allocate `count` physically contiguous pages and return them with
    /// their physmap address, ready for use without creating a region.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for `count == 0`; [`VmmError::NoMemory`]
    /// if no kernel-mapped run is free or the run is not covered by the
    /// physmap.
    pub fn alloc_kpages(&self, count: usize) -> Result<(VirtualAddress, FrameList), VmmError> {
        let (pa, frames) = self.pfa.alloc_kmapped(count)?;
        let last = pa + pages_to_bytes(count.saturating_sub(1));
        match (self.paddr_to_kvaddr(pa), self.paddr_to_kvaddr(last)) {
            (Some(va), Some(_)) => {
                debug!("vmm: {count} kernel pages at {va} -> {pa}");
                Ok((va, frames))
            }
            _ => {
                warn!("vmm: kernel-mapped run at {pa} is outside the physmap");
                self.pfa.free_frames(frames);
                Err(VmmError::NoMemory)
            }
        }
    }

    /// Return pages from [`alloc_kpages`](Self::alloc_kpages).
    pub fn free_kpages(&self, frames: FrameList) {
        let freed = self.pfa.free_frames(frames);
        debug!("vmm: freed {freed} kernel pages");
    }

    /// Take the frames behind the kernel mapping of `[vaddr, vaddr + len)`
    /// out of the frame allocator for good. Boot code calls this for the
    /// kernel image and the boot-time heap, which were in use before any
    /// arena was registered.
    ///
    /// Frames already allocated, or not managed by the frame allocator, are
    /// skipped. Returns the number of frames taken.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] if the range leaves the kernel window;
    /// [`VmmError::NotFound`] at the first unmapped page, with the frames
    /// before it already taken.
    pub fn mark_pages_in_use(&self, vaddr: VirtualAddress, len: u64) -> Result<usize, VmmError> {
        if len == 0 {
            return Ok(0);
        }
        let start = align_down(vaddr.as_u64(), PAGE_SIZE);
        let end = vaddr
            .as_u64()
            .checked_add(len)
            .and_then(|end| align_up(end, PAGE_SIZE))
            .ok_or(VmmError::InvalidArgument)?;
        if !self
            .layout
            .is_kernel_range(VirtualAddress::new(start), end - start)
        {
            return Err(VmmError::InvalidArgument);
        }

        let mut taken = 0_usize;
        for page in (0..(end - start) / PAGE_SIZE).map(|i| start + i * PAGE_SIZE) {
            let (pa, _) = self.query(&self.kernel, VirtualAddress::new(page))?;
            match self.pfa.alloc_at(pa, 1) {
                Ok(_) => taken += 1,
                Err(PmmError::AlreadyAllocated | PmmError::NoMemory) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("vmm: {taken} frames behind {vaddr}+{len:#x} marked in use");
        Ok(taken)
    }

    /// Reserve the kernel address space the boot-time `mappings` cover, so
    /// no allocation lands on them. Temporary mappings are skipped; the rest
    /// are widened to whole pages.
    ///
    /// # Errors
    /// The first failure of [`reserve`](Self::reserve).
    pub fn reserve_initial_mappings(&self, mappings: &[InitialMapping]) -> Result<(), VmmError> {
        for map in mappings.iter().filter(|map| !map.temporary) {
            let start = map.virt.page_base();
            let end = map
                .virt
                .as_u64()
                .checked_add(map.size)
                .and_then(|end| align_up(end, PAGE_SIZE))
                .ok_or(VmmError::InvalidArgument)?;
            self.reserve(&self.kernel, map.name, end - start.as_u64(), start)?;
        }
        Ok(())
    }
}
