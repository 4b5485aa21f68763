//! Simulated machine for walker tests: RAM behind a [`PhysMapper`], a frame
//! allocator over that RAM and a hardware double that records every register
//! write and TLB flush.

#![allow(dead_code, unsafe_code)]

use kernel_alloc::{ArenaFlags, FrameAllocator, PhysicalFrameAllocator};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    Arm64, ArmLpae, MmuHardware, PageTable, PageTableFormat, PageTableWalker, PhysMapper, Sv39,
    Sv48,
};
use std::cell::UnsafeCell;
use std::sync::Mutex;

pub const RAM_BASE: u64 = 0x8000_0000;

pub const USER_BASE: u64 = 0x0100_0000;
pub const USER_SIZE: u64 = 0x0F00_0000;

/// Per-format kernel windows used by the tests (1 GiB each on 64-bit).
pub trait TestFormat: PageTableFormat {
    const KERNEL_BASE: u64;
    const KERNEL_SIZE: u64;
    /// Whether leaves carry the cache policy.
    const ENCODES_CACHE: bool;
}

impl TestFormat for Sv39 {
    const KERNEL_BASE: u64 = 0xFFFF_FFC0_0000_0000;
    const KERNEL_SIZE: u64 = 0x4000_0000;
    const ENCODES_CACHE: bool = false;
}

impl TestFormat for Sv48 {
    const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;
    const KERNEL_SIZE: u64 = 0x4000_0000;
    const ENCODES_CACHE: bool = false;
}

impl TestFormat for Arm64 {
    const KERNEL_BASE: u64 = 0xFFFF_0000_0000_0000;
    const KERNEL_SIZE: u64 = 0x4000_0000;
    const ENCODES_CACHE: bool = true;
}

impl TestFormat for ArmLpae {
    const KERNEL_BASE: u64 = 0x8000_0000;
    const KERNEL_SIZE: u64 = 0x8000_0000;
    const ENCODES_CACHE: bool = true;
}

/// One 4 KiB frame of simulated RAM.
#[repr(C, align(4096))]
pub struct Frame4K([u8; PAGE_SIZE as usize]);

/// Simulated physical RAM starting at `base`.
pub struct TestRam {
    base: u64,
    frames: Box<[UnsafeCell<Frame4K>]>,
}

// SAFETY: tests serialize access per address space, as the kernel does.
unsafe impl Sync for TestRam {}

impl TestRam {
    pub fn new(base: u64, pages: usize) -> Self {
        let frames = (0..pages)
            .map(|_| UnsafeCell::new(Frame4K([0; PAGE_SIZE as usize])))
            .collect();
        Self { base, frames }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: every table address the tests inspect lies inside the RAM.
        unsafe { self.phys_to_mut(pa) }
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
        let within = usize::try_from(offset % PAGE_SIZE).unwrap();

        // SAFETY: the frame is owned by `self` and outlives the test.
        unsafe { &mut *self.frames[idx].get().cast::<u8>().add(within).cast::<T>() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwEvent {
    InstallRoot(u64),
    DisableUserRoot,
    FlushPage(VirtualAddress, Option<u16>),
    FlushAsid(u16),
    FlushAll,
}

/// Hardware double that records what the walker asked for.
#[derive(Default)]
pub struct RecordingHw {
    events: Mutex<Vec<HwEvent>>,
}

impl RecordingHw {
    fn push(&self, e: HwEvent) {
        self.events.lock().unwrap().push(e);
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<HwEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl MmuHardware for RecordingHw {
    unsafe fn install_root(&self, value: u64) {
        self.push(HwEvent::InstallRoot(value));
    }

    unsafe fn disable_user_root(&self) {
        self.push(HwEvent::DisableUserRoot);
    }

    fn flush_page(&self, va: VirtualAddress, asid: Option<u16>) {
        self.push(HwEvent::FlushPage(va, asid));
    }

    fn flush_asid(&self, asid: u16) {
        self.push(HwEvent::FlushAsid(asid));
    }

    fn flush_all(&self) {
        self.push(HwEvent::FlushAll);
    }
}

pub type TestWalker<'m, F> = PageTableWalker<F, &'m TestRam, &'m RecordingHw, &'m PhysicalFrameAllocator>;

/// RAM, a frame allocator over all of it, and the hardware double.
pub struct Machine {
    pub ram: TestRam,
    pub pmm: PhysicalFrameAllocator,
    pub hw: RecordingHw,
}

impl Machine {
    pub fn new(pages: usize) -> Self {
        let pmm = PhysicalFrameAllocator::new();
        pmm.add_arena(
            "ram",
            PhysicalAddress::new(RAM_BASE),
            pages as u64 * PAGE_SIZE,
            ArenaFlags::new(),
        )
        .unwrap();
        Self {
            ram: TestRam::new(RAM_BASE, pages),
            pmm,
            hw: RecordingHw::default(),
        }
    }

    /// A walker around a freshly zeroed boot root taken from the allocator.
    pub fn walker<F: PageTableFormat>(&self, asid_bits: u32) -> TestWalker<'_, F> {
        let root = self.pmm.alloc_frames(1).unwrap().first().unwrap();
        self.ram.table(root).zero();
        PageTableWalker::new(&self.ram, &self.pmm, &self.hw, root, asid_bits)
    }
}

pub fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

pub fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}
