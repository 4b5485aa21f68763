//! # Page-Table Formats
//!
//! A [`PageTableFormat`] is the encoding half of an architecture: how a
//! virtual address splits into table indices, how entries are built and read
//! back, and what the translation-root register looks like. The walker is
//! written once against this trait.
//!
//! Levels are numbered from the leaf up:
//!
//! ```text
//! level LEVELS-1 (root) → ... → level 1 → level 0 (4 KiB leaves)
//! ```
//!
//! A leaf found at level `l` maps `2^(12 + 9*l)` bytes.

use crate::flags::MmuFlags;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};

/// Deepest tree any supported format walks.
pub const MAX_LEVELS: usize = 4;

/// Index bits resolved by every level below the root.
pub const INDEX_BITS: u32 = 9;

/// What a raw entry means at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Not valid; the hardware faults here.
    Invalid,
    /// Points to the next-level table.
    Table(PhysicalAddress),
    /// Maps memory: a page at level 0, a block above it.
    Leaf(PhysicalAddress),
    /// Bit pattern the architecture reserves.
    Corrupt,
}

/// Encoding rules of one translation scheme.
pub trait PageTableFormat {
    /// Human-readable name, for logs.
    const NAME: &'static str;

    /// Number of table levels, root included.
    const LEVELS: usize;

    /// Index bits resolved by the root table.
    const TOP_INDEX_BITS: u32;

    /// Width of a translated virtual address.
    const VA_BITS: u32;

    /// Widest ASID the format can carry in its root register.
    const MAX_ASID_BITS: u32;

    /// Whether user and kernel halves use separate root registers.
    ///
    /// Single-root formats share the kernel's top-level slots into every
    /// user root instead.
    const SPLIT_ROOTS: bool;

    /// Interpret `raw` found in a table at `level`.
    fn decode(raw: u64, level: usize) -> Slot;

    /// Entry pointing at the next-level table `table`.
    fn table_entry(table: PhysicalAddress) -> u64;

    /// Terminal entry mapping `pa` with `flags` at `level`.
    fn leaf_entry(pa: PhysicalAddress, flags: MmuFlags, level: usize, global: bool) -> u64;

    /// Flags encoded in a terminal entry.
    fn leaf_flags(raw: u64) -> MmuFlags;

    /// Value of the translation-root register for `root`, tagged with `asid`.
    fn root_register(root: PhysicalAddress, asid: Option<u16>) -> u64;

    /// Top table level.
    #[inline]
    #[must_use]
    fn top_level() -> usize {
        Self::LEVELS - 1
    }

    /// Address bits below the index of `level` (the span of one entry).
    #[inline]
    #[must_use]
    fn level_shift(level: usize) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let level = level as u32;
        PAGE_SHIFT + INDEX_BITS * level
    }

    /// Index of `va` in a table at `level`.
    #[inline]
    #[must_use]
    fn index(va: VirtualAddress, level: usize) -> usize {
        let bits = if level == Self::top_level() {
            Self::TOP_INDEX_BITS
        } else {
            INDEX_BITS
        };
        #[allow(clippy::cast_possible_truncation)]
        let idx = ((va.as_u64() >> Self::level_shift(level)) & ((1 << bits) - 1)) as usize;
        idx
    }

    /// Whether `va` is a well-formed address for this format: the bits above
    /// `VA_BITS` repeat the top translated bit.
    #[must_use]
    fn is_canonical(va: VirtualAddress) -> bool {
        #[allow(clippy::cast_possible_wrap)]
        let high = (va.as_u64() as i64) >> (Self::VA_BITS - 1);
        high == 0 || high == -1
    }
}
