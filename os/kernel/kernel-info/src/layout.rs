use crate::memory;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// The kernel and user windows the address-space manager hands out, and the
/// physmap inside the kernel window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLayout {
    pub kernel_base: VirtualAddress,
    pub kernel_size: u64,
    pub user_base: VirtualAddress,
    pub user_size: u64,
    /// Physical `physmap_phys_base` appears here. A zero `physmap_size`
    /// means there is no physmap.
    pub physmap_base: VirtualAddress,
    pub physmap_phys_base: PhysicalAddress,
    pub physmap_size: u64,
}

/// A mapping the boot code set up before the address-space manager existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialMapping {
    pub name: &'static str,
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
    pub size: u64,
    /// Torn down once boot is done; never reserved.
    pub temporary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("the {0} window is empty")]
    Empty(&'static str),
    #[error("the {0} window is not page aligned")]
    Misaligned(&'static str),
    #[error("the {0} window wraps around the end of the address space")]
    Wraps(&'static str),
    #[error("the kernel and user windows overlap")]
    Overlap,
    #[error("the physmap leaves the kernel window")]
    PhysmapOutside,
}

impl VmLayout {
    /// The layout described by the compile-time constants in [`memory`].
    #[must_use]
    pub const fn native() -> Self {
        Self {
            kernel_base: VirtualAddress::new(memory::KERNEL_ASPACE_BASE),
            kernel_size: memory::KERNEL_ASPACE_SIZE,
            user_base: VirtualAddress::new(memory::USER_ASPACE_BASE),
            user_size: memory::USER_ASPACE_SIZE,
            physmap_base: VirtualAddress::new(memory::PHYSMAP_BASE),
            physmap_phys_base: PhysicalAddress::new(memory::PHYSMAP_PHYS_BASE),
            physmap_size: memory::PHYSMAP_SIZE,
        }
    }

    /// Check that both windows are non-empty, page aligned and disjoint, and
    /// that a physmap, if any, is page aligned inside the kernel window.
    ///
    /// # Errors
    /// The first violated rule, as a [`LayoutError`].
    pub fn validate(&self) -> Result<(), LayoutError> {
        Self::check_window("kernel", self.kernel_base, self.kernel_size)?;
        Self::check_window("user", self.user_base, self.user_size)?;

        let user_last = self.user_base.as_u64() + (self.user_size - 1);
        let kernel_last = self.kernel_base.as_u64() + (self.kernel_size - 1);
        if self.user_base.as_u64() <= kernel_last && self.kernel_base.as_u64() <= user_last {
            return Err(LayoutError::Overlap);
        }

        if self.physmap_size != 0 {
            Self::check_window("physmap", self.physmap_base, self.physmap_size)?;
            if !self.physmap_phys_base.is_page_aligned() {
                return Err(LayoutError::Misaligned("physmap"));
            }
            if self
                .physmap_phys_base
                .as_u64()
                .checked_add(self.physmap_size - 1)
                .is_none()
            {
                return Err(LayoutError::Wraps("physmap"));
            }
            if !self.is_kernel_range(self.physmap_base, self.physmap_size) {
                return Err(LayoutError::PhysmapOutside);
            }
        }
        Ok(())
    }

    fn check_window(name: &'static str, base: VirtualAddress, size: u64) -> Result<(), LayoutError> {
        if size == 0 {
            return Err(LayoutError::Empty(name));
        }
        if !base.is_page_aligned() || !size.is_multiple_of(PAGE_SIZE) {
            return Err(LayoutError::Misaligned(name));
        }
        if base.as_u64().checked_add(size - 1).is_none() {
            return Err(LayoutError::Wraps(name));
        }
        Ok(())
    }

    /// Whether `[va, va + len)` lies entirely in the kernel window.
    #[must_use]
    pub const fn is_kernel_range(&self, va: VirtualAddress, len: u64) -> bool {
        va.range_within(len, self.kernel_base, self.kernel_size)
    }

    /// Whether `[va, va + len)` lies entirely in the user window.
    #[must_use]
    pub const fn is_user_range(&self, va: VirtualAddress, len: u64) -> bool {
        va.range_within(len, self.user_base, self.user_size)
    }

    /// Where `pa` appears in the physmap.
    #[must_use]
    pub const fn phys_to_kvirt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let (pa, base) = (pa.as_u64(), self.physmap_phys_base.as_u64());
        if pa < base || pa - base >= self.physmap_size {
            return None;
        }
        Some(VirtualAddress::new(self.physmap_base.as_u64() + (pa - base)))
    }

    /// The physical address behind `va` if it lies in the physmap.
    #[must_use]
    pub const fn kvirt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (va, base) = (va.as_u64(), self.physmap_base.as_u64());
        if va < base || va - base >= self.physmap_size {
            return None;
        }
        Some(PhysicalAddress::new(self.physmap_phys_base.as_u64() + (va - base)))
    }
}

impl Default for VmLayout {
    fn default() -> Self {
        Self::native()
    }
}
