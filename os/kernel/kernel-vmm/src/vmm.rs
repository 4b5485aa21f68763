use crate::aspace::AddressSpace;
use crate::region::{Region, RegionKind, RegionList};
use crate::VmmError;
use core::fmt;
use kernel_alloc::{FrameAllocator, FrameList};
use kernel_info::VmLayout;
use kernel_memory_addresses::{
    PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up, pages_to_bytes,
};
use kernel_vmem::{ArchAspace, AspaceKind, Mmu, MmuFlags};
use log::{debug, info};

mod boot;

/// The address-space manager.
///
/// Owns the kernel [`AddressSpace`] and hands out user ones. Every operation
/// takes the target address space's lock for its whole duration, so region
/// bookkeeping and page tables never disagree.
pub struct Vmm<'a, T: Mmu, A: FrameAllocator> {
    layout: VmLayout,
    mmu: &'a T,
    pfa: &'a A,
    kernel: AddressSpace,
}

/// Page-rounded size, effective alignment and page count of a request.
struct Placement {
    size: u64,
    align: u64,
    pages: usize,
}

impl Placement {
    fn new(size: u64, align_log2: u8) -> Result<Self, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidArgument);
        }
        let size = align_up(size, PAGE_SIZE).ok_or(VmmError::InvalidArgument)?;
        let shift = u32::from(align_log2).max(PAGE_SHIFT);
        let align = 1_u64.checked_shl(shift).ok_or(VmmError::InvalidArgument)?;
        let pages = usize::try_from(size / PAGE_SIZE).map_err(|_| VmmError::InvalidArgument)?;
        Ok(Self { size, align, pages })
    }
}

/// Where a request of `req.size` bytes goes in `aspace`: exactly at `hint`,
/// or at the lowest gap honoring `req.align`.
fn place(
    aspace: &AddressSpace,
    regions: &RegionList,
    req: &Placement,
    hint: Option<VirtualAddress>,
) -> Result<VirtualAddress, VmmError> {
    match hint {
        Some(va) => {
            if !va.is_page_aligned() || !aspace.contains(va, req.size) {
                return Err(VmmError::InvalidArgument);
            }
            if regions.overlaps(va, req.size) {
                return Err(VmmError::AlreadyAllocated);
            }
            Ok(va)
        }
        None => regions
            .find_gap(aspace.base(), aspace.size(), req.size, req.align)
            .ok_or(VmmError::NoMemory),
    }
}

/// Pages spanned by a region. Region sizes were validated on insertion.
#[allow(clippy::cast_possible_truncation)]
const fn pages_of(region: &Region) -> usize {
    (region.size / PAGE_SIZE) as usize
}

impl<'a, T: Mmu, A: FrameAllocator> Vmm<'a, T, A> {
    /// Validate `layout` and create the kernel address space over the root
    /// table `mmu` was built around.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for a bad layout or if the kernel address
    /// space already exists, [`VmmError::NoMemory`] if shared kernel tables
    /// cannot be allocated.
    pub fn new(layout: VmLayout, mmu: &'a T, pfa: &'a A) -> Result<Self, VmmError> {
        layout.validate()?;
        let arch = mmu.init_aspace(layout.kernel_base, layout.kernel_size, AspaceKind::Kernel)?;
        let kernel = AddressSpace::new("kernel", arch);
        info!(
            "vmm: kernel address space {}..{:#x}",
            layout.kernel_base,
            layout.kernel_base.as_u64() + (layout.kernel_size - 1)
        );
        Ok(Self {
            layout,
            mmu,
            pfa,
            kernel,
        })
    }

    #[must_use]
    pub const fn kernel(&self) -> &AddressSpace {
        &self.kernel
    }

    #[must_use]
    pub const fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// Create a user address space over the configured user window.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for [`AspaceKind::Kernel`], which exists
    /// exactly once; [`VmmError::NoMemory`] if the root table cannot be
    /// allocated.
    pub fn create_address_space(
        &self,
        name: &'static str,
        kind: AspaceKind,
    ) -> Result<AddressSpace, VmmError> {
        if kind == AspaceKind::Kernel {
            return Err(VmmError::InvalidArgument);
        }
        let arch = self
            .mmu
            .init_aspace(self.layout.user_base, self.layout.user_size, kind)?;
        let aspace = AddressSpace::new(name, arch);
        info!(
            "vmm: created address space '{name}' {}..{:#x}",
            aspace.base(),
            aspace.base().as_u64() + (aspace.size() - 1)
        );
        Ok(aspace)
    }

    /// Tear down a user address space: every region is unmapped and its
    /// frames returned, then the page tables and ASID are released.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for the kernel address space.
    pub fn free_address_space(&self, aspace: AddressSpace) -> Result<(), VmmError> {
        if aspace.kind() == AspaceKind::Kernel {
            return Err(VmmError::InvalidArgument);
        }
        let name = aspace.name();
        let mut inner = aspace.into_inner();
        let mut regions = 0_usize;
        while let Some(region) = inner.regions.pop_first() {
            self.release(&inner.arch, region);
            regions += 1;
        }
        self.mmu.destroy_aspace(inner.arch);
        info!("vmm: destroyed address space '{name}' ({regions} regions)");
        Ok(())
    }

    /// Allocate `size` bytes of fresh memory, at `vaddr_hint` if given and
    /// otherwise at the lowest free address aligned to `2^align_log2` (at
    /// least a page).
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for a zero or unrepresentable size or a
    /// misaligned or out-of-range hint, [`VmmError::AlreadyAllocated`] if the
    /// hinted range collides with a region, [`VmmError::NoMemory`] if no gap
    /// fits or frames or tables run out. Nothing is left allocated on failure.
    pub fn alloc(
        &self,
        aspace: &AddressSpace,
        name: &'static str,
        size: u64,
        vaddr_hint: Option<VirtualAddress>,
        align_log2: u8,
        flags: MmuFlags,
    ) -> Result<VirtualAddress, VmmError> {
        let req = Placement::new(size, align_log2)?;
        let mut inner = aspace.lock();
        inner.regions.reserve_one()?;
        let va = place(aspace, &inner.regions, &req, vaddr_hint)?;

        let frames = self.pfa.alloc_frames(req.pages)?;
        let mapped = frames.iter().enumerate().try_for_each(|(i, pa)| {
            self.mmu
                .map(&inner.arch, va + pages_to_bytes(i), pa, 1, flags)
                .map_err(|e| (i, e))
        });
        if let Err((done, e)) = mapped {
            self.mmu.unmap(&inner.arch, va, done);
            self.pfa.free_frames(frames);
            debug!("vmm: alloc of '{name}' in '{}' failed: {e}", aspace.name());
            return Err(e.into());
        }

        inner.regions.insert(Region {
            name,
            base: va,
            size: req.size,
            kind: RegionKind::Backed,
            flags,
            frames,
        });
        debug!("vmm: '{}' alloc '{name}' at {va}, {} pages", aspace.name(), req.pages);
        Ok(va)
    }

    /// Like [`alloc`](Self::alloc), backed by one physically contiguous run
    /// aligned to `2^align_log2`.
    ///
    /// # Errors
    /// As for [`alloc`](Self::alloc).
    pub fn alloc_contiguous(
        &self,
        aspace: &AddressSpace,
        name: &'static str,
        size: u64,
        vaddr_hint: Option<VirtualAddress>,
        align_log2: u8,
        flags: MmuFlags,
    ) -> Result<VirtualAddress, VmmError> {
        let req = Placement::new(size, align_log2)?;
        let mut inner = aspace.lock();
        inner.regions.reserve_one()?;
        let va = place(aspace, &inner.regions, &req, vaddr_hint)?;

        let (pa, frames) = self.pfa.alloc_contiguous(req.pages, align_log2)?;
        if let Err(e) = self.mmu.map(&inner.arch, va, pa, req.pages, flags) {
            self.pfa.free_frames(frames);
            return Err(e.into());
        }

        inner.regions.insert(Region {
            name,
            base: va,
            size: req.size,
            kind: RegionKind::Backed,
            flags,
            frames,
        });
        debug!(
            "vmm: '{}' alloc '{name}' at {va} -> {pa}, {} contiguous pages",
            aspace.name(),
            req.pages
        );
        Ok(va)
    }

    /// Map caller-owned physical memory, typically device registers.
    ///
    /// With `vaddr_hint` the region is placed exactly there, otherwise at
    /// the lowest free page. The frames are never returned to the frame
    /// allocator.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for an unaligned `size` or `pa`, or a
    /// hint outside the address space; [`VmmError::AlreadyAllocated`] if the
    /// hinted range collides with a region; [`VmmError::NoMemory`] if no gap
    /// fits or tables run out.
    pub fn alloc_physical(
        &self,
        aspace: &AddressSpace,
        name: &'static str,
        size: u64,
        vaddr_hint: Option<VirtualAddress>,
        pa: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<VirtualAddress, VmmError> {
        if !size.is_multiple_of(PAGE_SIZE) || !pa.is_page_aligned() {
            return Err(VmmError::InvalidArgument);
        }
        let req = Placement::new(size, 0)?;
        let mut inner = aspace.lock();
        inner.regions.reserve_one()?;

        let va = place(aspace, &inner.regions, &req, vaddr_hint)?;

        self.mmu.map(&inner.arch, va, pa, req.pages, flags)?;
        inner.regions.insert(Region {
            name,
            base: va,
            size: req.size,
            kind: RegionKind::Physical,
            flags,
            frames: FrameList::new(),
        });
        debug!("vmm: '{}' map '{name}' at {va} -> {pa}", aspace.name());
        Ok(va)
    }

    /// Keep `[vaddr, vaddr + size)` out of future allocations without
    /// mapping anything. The range is trimmed to the address space; the
    /// region records the flags of whatever is already mapped at `vaddr`.
    ///
    /// # Errors
    /// [`VmmError::InvalidArgument`] for an unaligned or empty range or a
    /// start outside the address space, [`VmmError::AlreadyAllocated`] on a
    /// collision.
    pub fn reserve(
        &self,
        aspace: &AddressSpace,
        name: &'static str,
        size: u64,
        vaddr: VirtualAddress,
    ) -> Result<(), VmmError> {
        if size == 0 || !size.is_multiple_of(PAGE_SIZE) || !vaddr.is_page_aligned() {
            return Err(VmmError::InvalidArgument);
        }
        if !aspace.contains(vaddr, PAGE_SIZE) {
            return Err(VmmError::InvalidArgument);
        }
        let room = aspace.size() - (vaddr - aspace.base());
        let req = Placement::new(size.min(room), 0)?;

        let mut inner = aspace.lock();
        if inner.regions.overlaps(vaddr, req.size) {
            return Err(VmmError::AlreadyAllocated);
        }
        inner.regions.reserve_one()?;
        let flags = self
            .mmu
            .query(&inner.arch, vaddr)
            .map_or(MmuFlags::new(), |(_, flags)| flags);

        inner.regions.insert(Region {
            name,
            base: vaddr,
            size: req.size,
            kind: RegionKind::Reserved,
            flags,
            frames: FrameList::new(),
        });
        debug!(
            "vmm: '{}' reserve '{name}' at {vaddr}, {} pages",
            aspace.name(),
            req.pages
        );
        Ok(())
    }

    /// Remove the region covering `vaddr`, unmap it and return its frames.
    ///
    /// # Errors
    /// [`VmmError::NotFound`] if no region covers `vaddr`.
    pub fn free_region(&self, aspace: &AddressSpace, vaddr: VirtualAddress) -> Result<(), VmmError> {
        let mut inner = aspace.lock();
        let idx = inner
            .regions
            .position_covering(vaddr)
            .ok_or(VmmError::NotFound)?;
        let region = inner.regions.remove(idx);
        debug!("vmm: '{}' free '{}' at {}", aspace.name(), region.name, region.base);
        self.release(&inner.arch, region);
        Ok(())
    }

    fn release(&self, arch: &ArchAspace, region: Region) {
        self.mmu.unmap(arch, region.base, pages_of(&region));
        if !region.frames.is_empty() {
            self.pfa.free_frames(region.frames);
        }
    }

    /// Translate `vaddr` in `aspace`.
    ///
    /// # Errors
    /// [`VmmError::NotFound`] if nothing is mapped there,
    /// [`VmmError::InvalidArgument`] if `vaddr` is outside the address space.
    pub fn query(
        &self,
        aspace: &AddressSpace,
        vaddr: VirtualAddress,
    ) -> Result<(PhysicalAddress, MmuFlags), VmmError> {
        let inner = aspace.lock();
        Ok(self.mmu.query(&inner.arch, vaddr)?)
    }

    /// Switch this core to `aspace`, or to the kernel-only context for `None`.
    ///
    /// # Safety
    /// The running code and its stack must stay mapped in the new context.
    pub unsafe fn context_switch(&self, aspace: Option<&AddressSpace>) {
        match aspace {
            Some(aspace) => {
                let inner = aspace.lock();
                debug!("vmm: switch to '{}'", aspace.name());
                unsafe { self.mmu.context_switch(Some(&inner.arch)) };
            }
            None => {
                debug!("vmm: switch to the kernel context");
                unsafe { self.mmu.context_switch(None) };
            }
        }
    }
}

impl<T: Mmu, A: FrameAllocator> fmt::Debug for Vmm<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vmm")
            .field("layout", &self.layout)
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
