//! # Page-Table Walker
//!
//! [`PageTableWalker`] implements [`Mmu`] once, generically over a
//! [`PageTableFormat`]. Every operation is a walk from the root of one address
//! space down to level 0, one page at a time.
//!
//! ## Table Ownership
//!
//! Intermediate tables come from the frame allocator and are owned by the
//! parent slot that points to them. The frame's reference count
//! ([`FrameRefs`]) is the table's live-entry counter:
//!
//! ```text
//! install child table / leaf  → retain(parent)
//! clear child table / leaf    → release(parent) == 0 → unlink parent, free, recurse
//! ```
//!
//! Root tables are never counted; the kernel root may be a static boot table
//! that no allocator owns. The top-level children of the kernel root are
//! pinned: user roots on single-root formats copy those slots, so they must
//! outlive every user address space.
//!
//! ## Failure Model
//!
//! Running out of frames for an intermediate table is recoverable: the walk
//! prunes the tables it just created, unmaps the pages the call already
//! installed and returns [`MapError::NoMemory`]. Requests outside the address
//! space, remapping a live leaf and corrupted entries are caller bugs and
//! panic.

use crate::asid::AsidPool;
use crate::format::{MAX_LEVELS, PageTableFormat, Slot};
use crate::hardware::MmuHardware;
use crate::mmu::{ArchAspace, AspaceKind, Mmu};
use crate::table::{ENTRIES, PageTable};
use crate::{MapError, MmuFlags, PhysMapper, QueryError};
use core::fmt;
use core::marker::PhantomData;
use core::ops::RangeInclusive;
use kernel_alloc::{FrameAllocator, FrameList, FrameRefs};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_to_bytes};
use kernel_sync::SyncOnceCell;
use log::{debug, error, info, trace};

/// Tables visited by one walk, indexed by level.
type Path = [PhysicalAddress; MAX_LEVELS];

#[cold]
#[track_caller]
fn fatal(args: fmt::Arguments<'_>) -> ! {
    error!("vmem: {args}");
    panic!("{args}");
}

/// The generic walker behind [`Mmu`].
///
/// * `F`: entry encoding and tree shape.
/// * `M`: reaches tables through their physical address.
/// * `H`: root register and TLB maintenance.
/// * `A`: source of table frames and their live-entry counters.
pub struct PageTableWalker<F, M, H, A> {
    mapper: M,
    frames: A,
    hw: H,
    kernel_root: PhysicalAddress,
    asids: Option<AsidPool>,
    kernel_window: SyncOnceCell<(VirtualAddress, u64)>,
    _format: PhantomData<fn() -> F>,
}

impl<F, M, H, A> PageTableWalker<F, M, H, A>
where
    F: PageTableFormat,
    M: PhysMapper,
    H: MmuHardware,
    A: FrameAllocator + FrameRefs,
{
    /// Build a walker around the boot root table `kernel_root`.
    ///
    /// `asid_bits` is the ASID width the hardware reports; it is clamped to
    /// what `F` can encode and `0` disables ASIDs.
    pub fn new(mapper: M, frames: A, hw: H, kernel_root: PhysicalAddress, asid_bits: u32) -> Self {
        let bits = asid_bits.min(F::MAX_ASID_BITS);
        let asids = AsidPool::new(bits);
        info!(
            "vmem: {} walker, kernel root {kernel_root}, {} ASIDs",
            F::NAME,
            asids.as_ref().map_or(0, AsidPool::capacity)
        );
        Self {
            mapper,
            frames,
            hw,
            kernel_root,
            asids,
            kernel_window: SyncOnceCell::new(),
            _format: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    #[inline]
    #[must_use]
    pub const fn asid_pool(&self) -> Option<&AsidPool> {
        self.asids.as_ref()
    }

    #[inline]
    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &A {
        &self.frames
    }

    /// The kernel window, once the kernel address space exists.
    #[must_use]
    pub fn kernel_window(&self) -> Option<(VirtualAddress, u64)> {
        self.kernel_window.get().copied()
    }

    fn with_table<R>(&self, pa: PhysicalAddress, f: impl FnOnce(&mut PageTable) -> R) -> R {
        // SAFETY: `pa` is a root adopted at construction or a table this walker
        // allocated; the owning address space's lock serializes edits to it.
        f(unsafe { self.mapper.phys_to_mut::<PageTable>(pa) })
    }

    fn entry(&self, table: PhysicalAddress, idx: usize) -> u64 {
        self.with_table(table, |t| t.get(idx))
    }

    fn set_entry(&self, table: PhysicalAddress, idx: usize, raw: u64) {
        self.with_table(table, |t| t.set(idx, raw));
    }

    fn alloc_table(&self) -> Option<PhysicalAddress> {
        let pa = self.frames.alloc_frames(1).ok()?.into_iter().next()?;
        self.with_table(pa, PageTable::zero);
        debug!("vmem: allocated table {pa}");
        Some(pa)
    }

    fn free_table(&self, pa: PhysicalAddress) {
        self.frames.free_frames(core::iter::once(pa).collect::<FrameList>());
        debug!("vmem: freed table {pa}");
    }

    /// Top-level indices covering `[base, base + size)`.
    fn top_slots(base: VirtualAddress, size: u64) -> RangeInclusive<usize> {
        let top = F::top_level();
        let last = VirtualAddress::new(base.as_u64() + (size - 1));
        F::index(base, top)..=F::index(last, top)
    }

    /// Top-level children of the kernel root are never reclaimed.
    fn is_pinned(aspace: &ArchAspace, level: usize) -> bool {
        aspace.kind == AspaceKind::Kernel && level + 1 == F::top_level()
    }

    fn check_range(aspace: &ArchAspace, va: VirtualAddress, count: usize, op: &str) {
        let inside = (count as u64).checked_mul(PAGE_SIZE).is_some_and(|bytes| {
            aspace.contains(va, bytes)
                && F::is_canonical(va)
                && F::is_canonical(VirtualAddress::new(va.as_u64() + (bytes - PAGE_SIZE)))
        });
        if !inside {
            fatal(format_args!(
                "{op} of {count} pages at {va} outside address space {}+{:#x}",
                aspace.base, aspace.size
            ));
        }
    }

    /// Install one 4 KiB leaf, creating tables on the way down.
    fn map_page(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<(), MapError> {
        let mut path: Path = [PhysicalAddress::zero(); MAX_LEVELS];
        let mut table = aspace.root;

        for level in (1..F::LEVELS).rev() {
            path[level] = table;
            let idx = F::index(va, level);
            table = match F::decode(self.entry(table, idx), level) {
                Slot::Table(next) => next,
                Slot::Invalid => {
                    let Some(next) = self.alloc_table() else {
                        self.discard_if_empty(aspace, &path, va, level);
                        return Err(MapError::NoMemory { va, level: level - 1 });
                    };
                    self.set_entry(table, idx, F::table_entry(next));
                    self.retain(table, level);
                    next
                }
                Slot::Leaf(block) => fatal(format_args!(
                    "map of {va}: level {level} already maps block {block}"
                )),
                Slot::Corrupt => fatal(format_args!(
                    "map of {va}: corrupt entry {:#x} at level {level}",
                    self.entry(table, idx)
                )),
            };
        }

        let idx = F::index(va, 0);
        match F::decode(self.entry(table, idx), 0) {
            Slot::Invalid => {}
            Slot::Leaf(old) => fatal(format_args!("{va} is already mapped to {old}")),
            Slot::Table(_) | Slot::Corrupt => fatal(format_args!(
                "map of {va}: corrupt leaf entry {:#x}",
                self.entry(table, idx)
            )),
        }
        let global = aspace.kind == AspaceKind::Kernel;
        self.set_entry(table, idx, F::leaf_entry(pa, flags, 0, global));
        self.retain(table, 0);
        trace!("vmem: {va} -> {pa} {flags:?}");
        Ok(())
    }

    /// Count a new entry in `table`; roots are not counted.
    fn retain(&self, table: PhysicalAddress, level: usize) {
        if level < F::top_level() {
            self.frames.retain_frame(table);
        }
    }

    /// An entry of `path[level]` was cleared: drop its live count and reclaim
    /// the table once it is empty.
    fn release_entry(&self, aspace: &ArchAspace, path: &Path, va: VirtualAddress, level: usize) {
        if level == F::top_level() {
            return;
        }
        if self.frames.release_frame(path[level]) == 0 && !Self::is_pinned(aspace, level) {
            self.prune(aspace, path, va, level);
        }
    }

    /// Unlink the empty table `path[level]` from its parent and free it.
    fn prune(&self, aspace: &ArchAspace, path: &Path, va: VirtualAddress, level: usize) {
        let parent = level + 1;
        self.set_entry(path[parent], F::index(va, parent), 0);
        self.free_table(path[level]);
        self.release_entry(aspace, path, va, parent);
    }

    /// A walk failed below `path[level]`; drop that table if the walk itself
    /// created it and nothing else lives in it.
    fn discard_if_empty(&self, aspace: &ArchAspace, path: &Path, va: VirtualAddress, level: usize) {
        if level < F::top_level()
            && !Self::is_pinned(aspace, level)
            && self.with_table(path[level], |t| t.populated()) == 0
        {
            self.prune(aspace, path, va, level);
        }
    }

    /// Remove the leaf for `va`, or report the level at which the walk hit a
    /// hole.
    fn unmap_page(&self, aspace: &ArchAspace, va: VirtualAddress) -> Result<(), usize> {
        let mut path: Path = [PhysicalAddress::zero(); MAX_LEVELS];
        let mut table = aspace.root;
        let mut level = F::top_level();

        loop {
            path[level] = table;
            let idx = F::index(va, level);
            match F::decode(self.entry(table, idx), level) {
                Slot::Invalid => return Err(level),
                Slot::Table(next) if level > 0 => {
                    table = next;
                    level -= 1;
                }
                Slot::Leaf(pa) if level == 0 => {
                    self.set_entry(table, idx, 0);
                    self.hw.flush_page(va, aspace.asid);
                    self.release_entry(aspace, &path, va, 0);
                    trace!("vmem: unmapped {va} (was {pa})");
                    return Ok(());
                }
                Slot::Leaf(block) => fatal(format_args!(
                    "unmap of {va}: level {level} maps block {block}"
                )),
                Slot::Table(_) | Slot::Corrupt => fatal(format_args!(
                    "unmap of {va}: corrupt entry {:#x} at level {level}",
                    self.entry(table, idx)
                )),
            }
        }
    }

    fn unmap_pages(&self, aspace: &ArchAspace, va: VirtualAddress, count: usize) -> usize {
        let mut cursor = va.as_u64();
        let mut remaining = count as u64;
        let mut removed = 0;

        while remaining > 0 {
            let step = match self.unmap_page(aspace, VirtualAddress::new(cursor)) {
                Ok(()) => {
                    removed += 1;
                    1
                }
                // Nothing is mapped up to the end of the hole's span.
                Err(level) => {
                    let span = 1_u64 << F::level_shift(level);
                    ((span - (cursor & (span - 1))) >> PAGE_SHIFT).min(remaining)
                }
            };
            remaining -= step;
            cursor = cursor.wrapping_add(step << PAGE_SHIFT);
        }
        removed
    }

    /// Free `table` at `level` and every table below it.
    fn free_subtree(&self, table: PhysicalAddress, level: usize) {
        if level > 0 {
            for idx in 0..ENTRIES {
                let raw = self.entry(table, idx);
                match F::decode(raw, level) {
                    Slot::Table(child) => self.free_subtree(child, level - 1),
                    Slot::Invalid | Slot::Leaf(_) => {}
                    Slot::Corrupt => fatal(format_args!(
                        "destroy: corrupt entry {raw:#x} in table {table}"
                    )),
                }
            }
        }
        self.free_table(table);
    }

    fn init_kernel(&self, base: VirtualAddress, size: u64) -> Result<ArchAspace, MapError> {
        if self.kernel_window.is_initialized() {
            return Err(MapError::InvalidArgument(
                "kernel address space already initialized",
            ));
        }

        if !F::SPLIT_ROOTS {
            let top = F::top_level();
            for idx in Self::top_slots(base, size) {
                if F::decode(self.entry(self.kernel_root, idx), top) != Slot::Invalid {
                    continue;
                }
                let table = self
                    .alloc_table()
                    .ok_or(MapError::NoMemory { va: base, level: top - 1 })?;
                self.set_entry(self.kernel_root, idx, F::table_entry(table));
            }
        }

        if self.kernel_window.set((base, size)).is_err() {
            return Err(MapError::InvalidArgument(
                "kernel address space already initialized",
            ));
        }
        info!("vmem: kernel address space {base}+{size:#x}, root {}", self.kernel_root);
        Ok(ArchAspace {
            root: self.kernel_root,
            asid: None,
            base,
            size,
            kind: AspaceKind::Kernel,
        })
    }

    fn init_user(&self, base: VirtualAddress, size: u64) -> Result<ArchAspace, MapError> {
        let shared = if F::SPLIT_ROOTS {
            None
        } else {
            let Some(&(kernel_base, kernel_size)) = self.kernel_window.get() else {
                return Err(MapError::InvalidArgument(
                    "kernel address space not initialized",
                ));
            };
            let kernel = Self::top_slots(kernel_base, kernel_size);
            let user = Self::top_slots(base, size);
            if user.start() <= kernel.end() && kernel.start() <= user.end() {
                return Err(MapError::InvalidArgument(
                    "user window shares top-level slots with the kernel",
                ));
            }
            Some(kernel)
        };

        let root = self.alloc_table().ok_or(MapError::NoMemory {
            va: base,
            level: F::top_level(),
        })?;
        if let Some(slots) = shared {
            for idx in slots {
                self.set_entry(root, idx, self.entry(self.kernel_root, idx));
            }
        }
        let asid = self.asids.as_ref().and_then(AsidPool::alloc);

        info!("vmem: user address space {base}+{size:#x}, root {root}, asid {asid:?}");
        Ok(ArchAspace {
            root,
            asid,
            base,
            size,
            kind: AspaceKind::User,
        })
    }
}

impl<F, M, H, A> Mmu for PageTableWalker<F, M, H, A>
where
    F: PageTableFormat,
    M: PhysMapper,
    H: MmuHardware,
    A: FrameAllocator + FrameRefs,
{
    fn init_aspace(
        &self,
        base: VirtualAddress,
        size: u64,
        kind: AspaceKind,
    ) -> Result<ArchAspace, MapError> {
        if !base.is_page_aligned() || size == 0 || !size.is_multiple_of(PAGE_SIZE) {
            return Err(MapError::InvalidArgument("unaligned address space window"));
        }
        let Some(last) = base.checked_add(size - 1) else {
            return Err(MapError::InvalidArgument("address space window wraps"));
        };
        if !F::is_canonical(base) || !F::is_canonical(last) {
            return Err(MapError::InvalidArgument("address space window is not canonical"));
        }

        match kind {
            AspaceKind::Kernel => self.init_kernel(base, size),
            AspaceKind::User => self.init_user(base, size),
        }
    }

    fn destroy_aspace(&self, aspace: ArchAspace) {
        if aspace.kind == AspaceKind::Kernel {
            fatal(format_args!("the kernel address space cannot be destroyed"));
        }

        match aspace.asid {
            Some(asid) => self.hw.flush_asid(asid),
            None => self.hw.flush_all(),
        }

        let top = F::top_level();
        for idx in Self::top_slots(aspace.base, aspace.size) {
            let raw = self.entry(aspace.root, idx);
            match F::decode(raw, top) {
                Slot::Table(table) => {
                    self.set_entry(aspace.root, idx, 0);
                    self.free_subtree(table, top - 1);
                }
                Slot::Invalid | Slot::Leaf(_) => {}
                Slot::Corrupt => fatal(format_args!(
                    "destroy: corrupt root entry {raw:#x} in {}",
                    aspace.root
                )),
            }
        }
        self.free_table(aspace.root);

        if let (Some(asid), Some(pool)) = (aspace.asid, self.asids.as_ref()) {
            pool.release(asid);
        }
        info!("vmem: destroyed address space {}+{:#x}", aspace.base, aspace.size);
    }

    fn map(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: usize,
        flags: MmuFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::InvalidArgument("unaligned address"));
        }
        if count == 0 {
            return Ok(());
        }
        Self::check_range(aspace, va, count, "map");

        for i in 0..count {
            let offset = pages_to_bytes(i);
            if let Err(e) = self.map_page(aspace, va + offset, pa + offset, flags) {
                let undone = self.unmap_pages(aspace, va, i);
                debug!("vmem: map of {count} pages at {va} failed after {i}, undid {undone}: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    fn unmap(&self, aspace: &ArchAspace, va: VirtualAddress, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        if !va.is_page_aligned() {
            fatal(format_args!("unmap of unaligned address {va}"));
        }
        Self::check_range(aspace, va, count, "unmap");
        self.unmap_pages(aspace, va, count)
    }

    fn query(
        &self,
        aspace: &ArchAspace,
        va: VirtualAddress,
    ) -> Result<(PhysicalAddress, MmuFlags), QueryError> {
        if !aspace.contains(va.page_base(), PAGE_SIZE) || !F::is_canonical(va) {
            return Err(QueryError::OutOfRange(va));
        }

        let mut table = aspace.root;
        for level in (0..F::LEVELS).rev() {
            let raw = self.entry(table, F::index(va, level));
            match F::decode(raw, level) {
                Slot::Invalid => return Err(QueryError::NotFound(va)),
                Slot::Table(next) => table = next,
                Slot::Leaf(pa) => {
                    let mask = (1_u64 << F::level_shift(level)) - 1;
                    return Ok((pa + (va.as_u64() & mask), F::leaf_flags(raw)));
                }
                Slot::Corrupt => fatal(format_args!(
                    "query of {va}: corrupt entry {raw:#x} at level {level}"
                )),
            }
        }
        fatal(format_args!("query of {va}: walk ended below level 0"))
    }

    unsafe fn context_switch(&self, aspace: Option<&ArchAspace>) {
        match aspace {
            Some(user) if user.kind == AspaceKind::User => {
                debug!("vmem: switch to {} (asid {:?})", user.root, user.asid);
                unsafe { self.hw.install_root(F::root_register(user.root, user.asid)) };
                if user.asid.is_none() {
                    self.hw.flush_all();
                }
            }
            _ if F::SPLIT_ROOTS => {
                debug!("vmem: switch to kernel-only context");
                unsafe { self.hw.disable_user_root() };
                if self.asids.is_none() {
                    self.hw.flush_all();
                }
            }
            _ => {
                debug!("vmem: switch to kernel root {}", self.kernel_root);
                let asid = self.asids.as_ref().map(|_| 0);
                unsafe { self.hw.install_root(F::root_register(self.kernel_root, asid)) };
                if asid.is_none() {
                    self.hw.flush_all();
                }
            }
        }
    }
}

impl<F: PageTableFormat, M, H, A> fmt::Debug for PageTableWalker<F, M, H, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableWalker")
            .field("format", &F::NAME)
            .field("kernel_root", &self.kernel_root)
            .field("kernel_window", &self.kernel_window.get())
            .field("asids", &self.asids)
            .finish_non_exhaustive()
    }
}
