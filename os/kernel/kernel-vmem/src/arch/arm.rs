//! # ARM Long-Descriptor Translation (LPAE and ARMv8-A)
//!
//! 32-bit ARM with the Large Physical Address Extension and 64-bit ARM share
//! one 64-bit descriptor format. They differ in depth, in how wide the output
//! address may be, and in the size of the root table.
//!
//! ```text
//! | 63..55 | 54  | 53  | 52..48 | 47 ...... 12 | 11 | 10 | 9 8 | 7 6 | 5  | 4..2     | 1 0  |
//! |  SW    | UXN | PXN |  res   | output addr  | nG | AF | SH  | AP  | NS | AttrIndx | type |
//! ```
//!
//! `type` is `0b11` for a table above the last level and for a page at the
//! last level, and `0b01` for a block above the last level.
//!
//! `AttrIndx` selects one of the MAIR slots the kernel programs at boot:
//!
//! | Index | Memory type       | [`CachePolicy`]  |
//! |:------|:------------------|:-----------------|
//! | 0     | strongly ordered  | `Uncached`       |
//! | 1     | device            | `Device`         |
//! | 2     | normal, write-back| `Cached`         |
//!
//! `TTBR` holds `ASID << 48 | root`.

use crate::flags::{CachePolicy, MmuFlags};
use crate::format::{PageTableFormat, Slot};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// A long-format translation table descriptor.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct LongDescriptor {
    /// Descriptor is valid (bit 0).
    pub valid: bool,

    /// Table (above the last level) or page (at the last level) when set;
    /// block when clear (bit 1).
    pub table_or_page: bool,

    /// MAIR slot of the mapped memory (`AttrIndx`, bits 2..5).
    #[bits(3)]
    pub attr_index: u8,

    /// Non-secure output address (NS, bit 5).
    pub non_secure: bool,

    /// Access permissions (AP\[2:1\], bits 6..8).
    ///
    /// | AP | Kernel | User |
    /// |:---|:-------|:-----|
    /// | 0  | RW     | -    |
    /// | 1  | RW     | RW   |
    /// | 2  | RO     | -    |
    /// | 3  | RO     | RO   |
    #[bits(2)]
    pub access_perm: u8,

    /// Shareability (SH, bits 8..10). 3 is inner shareable.
    #[bits(2)]
    pub shareability: u8,

    /// Access flag (AF, bit 10). Pre-set so no access fault is taken.
    pub access_flag: bool,

    /// Not global (nG, bit 11): the TLB entry is tagged with the ASID.
    pub not_global: bool,

    /// Output address bits \[47:12\].
    #[bits(36)]
    pub output_frame: u64,

    /// Bits 48..53, including the contiguous hint.
    #[bits(5)]
    __reserved: u8,

    /// Privileged execute never (PXN, bit 53).
    pub pxn: bool,

    /// Unprivileged execute never (UXN / XN, bit 54).
    pub uxn: bool,

    /// Ignored by hardware (bits 55..64).
    #[bits(9)]
    pub software: u16,
}

const ATTR_STRONGLY_ORDERED: u8 = 0;
const ATTR_DEVICE: u8 = 1;
const ATTR_NORMAL: u8 = 2;
const SH_INNER: u8 = 3;
const TTBR_ASID_SHIFT: u32 = 48;

impl LongDescriptor {
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.output_frame())
    }
}

fn decode(raw: u64, level: usize) -> Slot {
    let desc = LongDescriptor::from_bits(raw);
    match (desc.valid(), desc.table_or_page(), level) {
        (false, _, _) => Slot::Invalid,
        (true, true, 0) => Slot::Leaf(desc.address()),
        (true, true, _) => Slot::Table(desc.address()),
        (true, false, 0) => Slot::Corrupt,
        (true, false, _) => Slot::Leaf(desc.address()),
    }
}

fn table_entry(table: PhysicalAddress) -> u64 {
    LongDescriptor::new()
        .with_valid(true)
        .with_table_or_page(true)
        .with_output_frame(table.frame_number())
        .into_bits()
}

fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, level: usize, global: bool) -> u64 {
    let (attr_index, shareability) = match flags.cache() {
        CachePolicy::Cached => (ATTR_NORMAL, SH_INNER),
        CachePolicy::Uncached => (ATTR_STRONGLY_ORDERED, 0),
        CachePolicy::Device => (ATTR_DEVICE, 0),
    };
    let access_perm = (u8::from(flags.read_only()) << 1) | u8::from(flags.user());

    // Kernel never executes user pages; user never executes kernel pages.
    let (pxn, uxn) = match (flags.no_execute(), flags.user()) {
        (true, _) => (true, true),
        (false, true) => (true, false),
        (false, false) => (false, true),
    };

    LongDescriptor::new()
        .with_valid(true)
        .with_table_or_page(level == 0)
        .with_attr_index(attr_index)
        .with_access_perm(access_perm)
        .with_shareability(shareability)
        .with_access_flag(true)
        .with_not_global(!global)
        .with_output_frame(pa.frame_number())
        .with_pxn(pxn)
        .with_uxn(uxn)
        .into_bits()
}

fn leaf_flags(raw: u64) -> MmuFlags {
    let desc = LongDescriptor::from_bits(raw);
    let user = desc.access_perm() & 1 != 0;
    let cache = match desc.attr_index() {
        ATTR_STRONGLY_ORDERED => CachePolicy::Uncached,
        ATTR_DEVICE => CachePolicy::Device,
        _ => CachePolicy::Cached,
    };
    MmuFlags::new()
        .with_user(user)
        .with_read_only(desc.access_perm() & 2 != 0)
        .with_no_execute(if user { desc.uxn() } else { desc.pxn() })
        .with_cache(cache)
}

fn ttbr(root: PhysicalAddress, asid: Option<u16>) -> u64 {
    (u64::from(asid.unwrap_or(0)) << TTBR_ASID_SHIFT) | root.as_u64()
}

/// ARMv8-A, 4 KiB granule, 48-bit virtual addresses, four levels.
///
/// `TTBR0_EL1` translates the lower (user) half and `TTBR1_EL1` the upper
/// (kernel) half.
#[derive(Debug, Clone, Copy)]
pub enum Arm64 {}

/// ARMv7-A with LPAE: 32-bit virtual addresses, three levels, up to 40-bit
/// physical addresses.
///
/// The first-level table has four entries, one per GiB. `TTBR0` serves the
/// user half and `TTBR1` the kernel half.
#[derive(Debug, Clone, Copy)]
pub enum ArmLpae {}

/// Largest physical address LPAE descriptors can hold.
const LPAE_OA_LIMIT: u64 = 1 << 40;

impl PageTableFormat for Arm64 {
    const NAME: &'static str = "ARM64";
    const LEVELS: usize = 4;
    const TOP_INDEX_BITS: u32 = 9;
    const VA_BITS: u32 = 48;
    const MAX_ASID_BITS: u32 = 16;
    const SPLIT_ROOTS: bool = true;

    fn decode(raw: u64, level: usize) -> Slot {
        decode(raw, level)
    }

    fn table_entry(table: PhysicalAddress) -> u64 {
        table_entry(table)
    }

    fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, level: usize, global: bool) -> u64 {
        leaf_entry(pa, flags, level, global)
    }

    fn leaf_flags(raw: u64) -> MmuFlags {
        leaf_flags(raw)
    }

    fn root_register(root: PhysicalAddress, asid: Option<u16>) -> u64 {
        ttbr(root, asid)
    }
}

impl PageTableFormat for ArmLpae {
    const NAME: &'static str = "ARM LPAE";
    const LEVELS: usize = 3;
    const TOP_INDEX_BITS: u32 = 2;
    const VA_BITS: u32 = 32;
    const MAX_ASID_BITS: u32 = 8;
    const SPLIT_ROOTS: bool = true;

    fn decode(raw: u64, level: usize) -> Slot {
        decode(raw, level)
    }

    fn table_entry(table: PhysicalAddress) -> u64 {
        debug_assert!(table.as_u64() < LPAE_OA_LIMIT);
        table_entry(table)
    }

    fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, level: usize, global: bool) -> u64 {
        debug_assert!(pa.as_u64() < LPAE_OA_LIMIT);
        leaf_entry(pa, flags, level, global)
    }

    fn leaf_flags(raw: u64) -> MmuFlags {
        leaf_flags(raw)
    }

    fn root_register(root: PhysicalAddress, asid: Option<u16>) -> u64 {
        ttbr(root, asid)
    }

    /// There is no sign extension: every 32-bit address is valid.
    fn is_canonical(va: VirtualAddress) -> bool {
        va.as_u64() >> Self::VA_BITS == 0
    }
}
