//! Simulated Sv39 machine for address-space tests.

#![allow(dead_code, unsafe_code)]

use kernel_alloc::{ArenaFlags, FrameAllocator, FrameList, PhysicalFrameAllocator, PmmError};
use kernel_info::VmLayout;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{MmuHardware, PageTable, PageTableWalker, PhysMapper, Sv39};
use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const RAM_BASE: u64 = 0x8000_0000;

pub const USER_BASE: u64 = 0x0100_0000;
pub const USER_SIZE: u64 = 0x0F00_0000;

pub const KERNEL_BASE: u64 = 0xFFFF_FFC0_0000_0000;
pub const KERNEL_SIZE: u64 = 0x4000_0000;

/// RAM appears at the bottom of the kernel window.
pub const PHYSMAP_BASE: u64 = KERNEL_BASE;
pub const PHYSMAP_SIZE: u64 = 0x1000_0000;

pub fn layout() -> VmLayout {
    VmLayout {
        kernel_base: VirtualAddress::new(KERNEL_BASE),
        kernel_size: KERNEL_SIZE,
        user_base: VirtualAddress::new(USER_BASE),
        user_size: USER_SIZE,
        physmap_base: VirtualAddress::new(PHYSMAP_BASE),
        physmap_phys_base: PhysicalAddress::new(RAM_BASE),
        physmap_size: PHYSMAP_SIZE,
    }
}

#[repr(C, align(4096))]
pub struct Frame4K([u8; PAGE_SIZE as usize]);

/// Simulated physical RAM starting at `base`.
pub struct TestRam {
    base: u64,
    frames: Box<[UnsafeCell<Frame4K>]>,
}

// SAFETY: each address space is locked while its tables are edited.
unsafe impl Sync for TestRam {}

impl TestRam {
    pub fn new(base: u64, pages: usize) -> Self {
        let frames = (0..pages)
            .map(|_| UnsafeCell::new(Frame4K([0; PAGE_SIZE as usize])))
            .collect();
        Self { base, frames }
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = pa
            .as_u64()
            .checked_sub(self.base)
            .expect("physical address below test RAM");
        let idx = usize::try_from(offset / PAGE_SIZE).unwrap();
        assert!(idx < self.frames.len(), "{pa} beyond test RAM");

        // SAFETY: the walker only asks for page tables it allocated here.
        unsafe { &mut *self.frames[idx].get().cast::<T>() }
    }
}

/// Counts root installs; everything else is a no-op.
#[derive(Default)]
pub struct TestHw {
    pub roots: Mutex<Vec<u64>>,
}

impl MmuHardware for TestHw {
    unsafe fn install_root(&self, value: u64) {
        self.roots.lock().unwrap().push(value);
    }

    unsafe fn disable_user_root(&self) {}

    fn flush_page(&self, _va: VirtualAddress, _asid: Option<u16>) {}

    fn flush_asid(&self, _asid: u16) {}

    fn flush_all(&self) {}
}

/// A [`FrameAllocator`] that counts calls before forwarding them.
pub struct CountingPfa<'a> {
    inner: &'a PhysicalFrameAllocator,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
}

impl<'a> CountingPfa<'a> {
    pub fn new(inner: &'a PhysicalFrameAllocator) -> Self {
        Self {
            inner,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }
}

impl FrameAllocator for CountingPfa<'_> {
    fn alloc_frames(&self, count: usize) -> Result<FrameList, PmmError> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.inner.alloc_frames(count)
    }

    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
    ) -> Result<(PhysicalAddress, FrameList), PmmError> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.inner.alloc_contiguous(count, align_log2)
    }

    fn alloc_at(&self, pa: PhysicalAddress, count: usize) -> Result<FrameList, PmmError> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.inner.alloc_at(pa, count)
    }

    fn alloc_kmapped(&self, count: usize) -> Result<(PhysicalAddress, FrameList), PmmError> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.inner.alloc_kmapped(count)
    }

    fn free_frames(&self, frames: FrameList) -> usize {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.inner.free_frames(frames)
    }

    fn free_count(&self) -> usize {
        self.inner.free_count()
    }
}

pub type TestWalker<'m> = PageTableWalker<Sv39, &'m TestRam, &'m TestHw, &'m PhysicalFrameAllocator>;

/// RAM, a frame allocator over all of it, and the hardware double.
pub struct Machine {
    pub ram: TestRam,
    pub pmm: PhysicalFrameAllocator,
    pub hw: TestHw,
}

impl Machine {
    pub fn new(pages: usize) -> Self {
        let pmm = PhysicalFrameAllocator::new();
        pmm.add_arena(
            "ram",
            PhysicalAddress::new(RAM_BASE),
            pages as u64 * PAGE_SIZE,
            ArenaFlags::new().with_kmap(true),
        )
        .unwrap();
        Self {
            ram: TestRam::new(RAM_BASE, pages),
            pmm,
            hw: TestHw::default(),
        }
    }

    /// A walker around a zeroed boot root, with 16-bit ASIDs. Page tables
    /// come straight from the allocator, bypassing any counting wrapper.
    pub fn walker(&self) -> TestWalker<'_> {
        let root = self.pmm.alloc_frames(1).unwrap().first().unwrap();
        // SAFETY: `root` was just allocated from the simulated RAM.
        let table: &mut PageTable = unsafe { self.ram.phys_to_mut(root) };
        table.zero();
        PageTableWalker::new(&self.ram, &self.pmm, &self.hw, root, 16)
    }
}

pub fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

pub fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}
