//! # RISC-V Sv39 / Sv48
//!
//! Both schemes use the same 64-bit PTE; they differ only in depth.
//!
//! ```text
//! | 63 .. 54 | 53 ........ 10 | 9 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//! | reserved |      PPN       | RSW | D | A | G | U | X | W | R | V |
//! ```
//!
//! An entry with `V=1` and `R=W=X=0` points to the next table; any of
//! `R`/`X` set makes it a leaf. `W` without `R` is reserved.
//!
//! The hardware has no per-page memory type: every leaf decodes as
//! [`CachePolicy::Cached`].
//!
//! `satp` holds `MODE << 60 | ASID << 44 | PPN(root)`.

use crate::flags::{CachePolicy, MmuFlags};
use crate::format::{PageTableFormat, Slot};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress};

/// A RISC-V page-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RiscvPte {
    /// Valid (V, bit 0).
    pub valid: bool,
    /// Readable (R, bit 1).
    pub read: bool,
    /// Writable (W, bit 2). Requires `read`.
    pub write: bool,
    /// Executable (X, bit 3).
    pub execute: bool,
    /// User accessible (U, bit 4).
    pub user: bool,
    /// Global (G, bit 5): present in every address space.
    pub global: bool,
    /// Accessed (A, bit 6). Pre-set so the hart never has to.
    pub accessed: bool,
    /// Dirty (D, bit 7). Pre-set on every leaf.
    pub dirty: bool,
    /// Reserved for software (RSW, bits 8..10).
    #[bits(2)]
    pub software: u8,
    /// Physical page number (bits 10..54).
    #[bits(44)]
    pub ppn: u64,
    #[bits(10)]
    __reserved: u16,
}

impl RiscvPte {
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.ppn())
    }

    #[inline]
    #[must_use]
    pub const fn is_table(self) -> bool {
        self.valid() && !self.read() && !self.write() && !self.execute()
    }
}

const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SV48: u64 = 9;
const SATP_ASID_SHIFT: u32 = 44;

fn decode(raw: u64, level: usize) -> Slot {
    let pte = RiscvPte::from_bits(raw);
    if !pte.valid() {
        Slot::Invalid
    } else if pte.write() && !pte.read() {
        Slot::Corrupt
    } else if pte.is_table() {
        if level == 0 {
            Slot::Corrupt
        } else {
            Slot::Table(pte.address())
        }
    } else {
        Slot::Leaf(pte.address())
    }
}

fn table_entry(table: PhysicalAddress) -> u64 {
    RiscvPte::new()
        .with_valid(true)
        .with_ppn(table.frame_number())
        .into_bits()
}

fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, global: bool) -> u64 {
    RiscvPte::new()
        .with_valid(true)
        .with_read(true)
        .with_write(!flags.read_only())
        .with_execute(!flags.no_execute())
        .with_user(flags.user())
        .with_global(global)
        .with_accessed(true)
        .with_dirty(true)
        .with_ppn(pa.frame_number())
        .into_bits()
}

fn leaf_flags(raw: u64) -> MmuFlags {
    let pte = RiscvPte::from_bits(raw);
    MmuFlags::new()
        .with_user(pte.user())
        .with_read_only(!pte.write())
        .with_no_execute(!pte.execute())
        .with_cache(CachePolicy::Cached)
}

fn satp(mode: u64, root: PhysicalAddress, asid: Option<u16>) -> u64 {
    (mode << 60) | (u64::from(asid.unwrap_or(0)) << SATP_ASID_SHIFT) | (root.as_u64() >> PAGE_SHIFT)
}

/// Three-level, 39-bit translation.
#[derive(Debug, Clone, Copy)]
pub enum Sv39 {}

/// Four-level, 48-bit translation.
#[derive(Debug, Clone, Copy)]
pub enum Sv48 {}

impl PageTableFormat for Sv39 {
    const NAME: &'static str = "Sv39";
    const LEVELS: usize = 3;
    const TOP_INDEX_BITS: u32 = 9;
    const VA_BITS: u32 = 39;
    const MAX_ASID_BITS: u32 = 16;
    const SPLIT_ROOTS: bool = false;

    fn decode(raw: u64, level: usize) -> Slot {
        decode(raw, level)
    }

    fn table_entry(table: PhysicalAddress) -> u64 {
        table_entry(table)
    }

    fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, _level: usize, global: bool) -> u64 {
        leaf_entry(pa, flags, global)
    }

    fn leaf_flags(raw: u64) -> MmuFlags {
        leaf_flags(raw)
    }

    fn root_register(root: PhysicalAddress, asid: Option<u16>) -> u64 {
        satp(SATP_MODE_SV39, root, asid)
    }
}

impl PageTableFormat for Sv48 {
    const NAME: &'static str = "Sv48";
    const LEVELS: usize = 4;
    const TOP_INDEX_BITS: u32 = 9;
    const VA_BITS: u32 = 48;
    const MAX_ASID_BITS: u32 = 16;
    const SPLIT_ROOTS: bool = false;

    fn decode(raw: u64, level: usize) -> Slot {
        decode(raw, level)
    }

    fn table_entry(table: PhysicalAddress) -> u64 {
        table_entry(table)
    }

    fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, _level: usize, global: bool) -> u64 {
        leaf_entry(pa, flags, global)
    }

    fn leaf_flags(raw: u64) -> MmuFlags {
        leaf_flags(raw)
    }

    fn root_register(root: PhysicalAddress, asid: Option<u16>) -> u64 {
        satp(SATP_MODE_SV48, root, asid)
    }
}
