use crate::bitmap::PageBitmap;
use kernel_alloc::PmmError;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use kernel_sync::{SpinMutex, TicketMutex};
use log::{error, info};

/// A page range tracked by a bitmap.
pub(crate) struct FlatArena {
    name: &'static str,
    base: PhysicalAddress,
    pages: usize,
    map: TicketMutex<PageBitmap>,
    /// Sub-page leftover in front of the first usable page; handed out once.
    remainder: SpinMutex<Option<(PhysicalAddress, usize)>>,
}

impl FlatArena {
    pub(crate) fn new(
        name: &'static str,
        base: PhysicalAddress,
        map: PageBitmap,
        remainder: Option<(PhysicalAddress, usize)>,
    ) -> Self {
        Self {
            name,
            base,
            pages: map.pages(),
            map: TicketMutex::new(map),
            remainder: SpinMutex::new(remainder),
        }
    }

    pub(crate) const fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) const fn base(&self) -> PhysicalAddress {
        self.base
    }

    pub(crate) const fn size(&self) -> u64 {
        (self.pages as u64) << PAGE_SHIFT
    }

    pub(crate) fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && pa - self.base < self.size()
    }

    pub(crate) fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        self.pages != 0
            && base.as_u64() < self.base.as_u64() + self.size()
            && self.base.as_u64() < base.as_u64() + size
    }

    pub(crate) fn free_count(&self) -> usize {
        self.pages - self.map.lock().count_set()
    }

    /// Claim the first run of `count` clear pages whose index is
    /// `first + k * step`.
    pub(crate) fn alloc_run(&self, count: usize, first: usize, step: usize) -> Option<PhysicalAddress> {
        let mut map = self.map.lock();
        let start = map.find_clear_run(count, first, step)?;
        map.set_range(start, count);
        Some(self.address_of(start))
    }

    /// First page index whose address is aligned to `align` bytes.
    pub(crate) fn first_aligned_index(&self, align: u64) -> Option<usize> {
        let aligned = kernel_memory_addresses::align_up(self.base.as_u64(), align)?;
        usize::try_from((aligned - self.base.as_u64()) >> PAGE_SHIFT).ok()
    }

    pub(crate) fn alloc_range(&self, pa: PhysicalAddress, count: usize) -> Result<(), PmmError> {
        let first = self.index_of(pa);
        if first + count > self.pages {
            return Err(PmmError::NoMemory);
        }
        let mut map = self.map.lock();
        if map.first_set_in(first, count).is_some() {
            return Err(PmmError::AlreadyAllocated);
        }
        map.set_range(first, count);
        Ok(())
    }

    /// # Panics
    /// If the range runs past the arena or any page in it is already free.
    pub(crate) fn free_range(&self, pa: PhysicalAddress, count: usize) {
        let first = self.index_of(pa);
        if first + count > self.pages {
            error!("novm: free of {count} pages at {pa} runs past arena '{}'", self.name);
            panic!("free of {count} pages at {pa} runs past arena '{}'", self.name);
        }

        let mut map = self.map.lock();
        for page in first..first + count {
            if !map.is_set(page) {
                error!("novm: double free of {} in arena '{}'", self.address_of(page), self.name);
                panic!("double free of page {} in arena '{}'", self.address_of(page), self.name);
            }
        }
        map.clear_range(first, count);
    }

    /// Clear the bit of the page at `pa`; `false` if it was already clear.
    pub(crate) fn release_page(&self, pa: PhysicalAddress) -> bool {
        let page = self.index_of(pa);
        let mut map = self.map.lock();
        let was_set = map.is_set(page);
        map.clear_range(page, 1);
        was_set
    }

    pub(crate) fn claim_page(&self, pa: PhysicalAddress) {
        let page = self.index_of(pa);
        self.map.lock().set_range(page, 1);
    }

    pub(crate) fn take_remainder(&self) -> Option<(PhysicalAddress, usize)> {
        self.remainder.lock().take()
    }

    /// Log the arena and a picture of its first 1024 pages.
    pub(crate) fn log_state(&self) {
        const ROW: usize = 64;
        const MAX_ROWS: usize = 16;

        let map = self.map.lock();
        info!(
            "novm arena '{}': {}..{}, {}/{} pages in use",
            self.name,
            self.base,
            self.base + self.size(),
            map.count_set(),
            self.pages
        );
        if let Some((pa, len)) = *self.remainder.lock() {
            info!("  unaligned remainder {pa}..{}", pa + len as u64);
        }

        let mut line = [b'.'; ROW];
        for row in 0..self.pages.div_ceil(ROW).min(MAX_ROWS) {
            let first = row * ROW;
            let width = ROW.min(self.pages - first);
            for (i, c) in line[..width].iter_mut().enumerate() {
                *c = if map.is_set(first + i) { b'*' } else { b'.' };
            }
            info!("  {}", core::str::from_utf8(&line[..width]).unwrap_or_default());
        }
        if self.pages > ROW * MAX_ROWS {
            info!("  etc., {} more pages", self.pages - ROW * MAX_ROWS);
        }
    }

    fn index_of(&self, pa: PhysicalAddress) -> usize {
        debug_assert!(self.contains(pa));
        ((pa - self.base) >> PAGE_SHIFT) as usize
    }

    fn address_of(&self, page: usize) -> PhysicalAddress {
        self.base + page as u64 * PAGE_SIZE
    }
}
