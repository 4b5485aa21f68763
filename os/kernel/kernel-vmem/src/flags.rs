//! # Mapping Flags
//!
//! Architecture-neutral attributes of a mapping. Every [`PageTableFormat`]
//! encodes them into its own entry bits and decodes them back.
//!
//! | Field        | Meaning when set                           |
//! |:-------------|:-------------------------------------------|
//! | `user`       | accessible from user mode                  |
//! | `read_only`  | writes fault                               |
//! | `no_execute` | instruction fetches fault                  |
//! | `cache`      | [`CachePolicy`] of the mapped memory       |
//!
//! Readability is implied: every valid mapping can be read.
//!
//! [`PageTableFormat`]: crate::PageTableFormat

use bitfield_struct::bitfield;

/// Memory type of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CachePolicy {
    /// Normal, write-back cacheable memory.
    #[default]
    Cached = 0,
    /// Strongly ordered, uncached memory.
    Uncached = 1,
    /// Device registers (MMIO).
    Device = 2,
}

impl CachePolicy {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Unknown encodings read back as [`Cached`](Self::Cached).
    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Uncached,
            2 => Self::Device,
            _ => Self::Cached,
        }
    }
}

/// Attributes passed to [`Mmu::map`](crate::Mmu::map) and returned by
/// [`Mmu::query`](crate::Mmu::query).
///
/// The empty value (`MmuFlags::new()`) is a kernel read/write/execute,
/// cached mapping.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MmuFlags {
    /// Accessible from user mode.
    pub user: bool,

    /// Writes fault.
    pub read_only: bool,

    /// Instruction fetches fault.
    pub no_execute: bool,

    /// Memory type.
    #[bits(2)]
    pub cache: CachePolicy,

    #[bits(27)]
    __reserved: u32,
}

impl MmuFlags {
    /// Kernel data: read/write, never executed.
    pub const RW: Self = Self::new().with_no_execute(true);

    /// Kernel constants.
    pub const RO: Self = Self::new().with_read_only(true).with_no_execute(true);

    /// Kernel text.
    pub const RX: Self = Self::new().with_read_only(true);

    /// MMIO window: read/write, never executed, device memory.
    pub const DEVICE: Self = Self::RW.with_cache(CachePolicy::Device);

    /// User data.
    pub const USER_RW: Self = Self::RW.with_user(true);

    /// User text.
    pub const USER_RX: Self = Self::RX.with_user(true);

    /// Whether writes are permitted.
    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        !self.read_only()
    }

    /// Whether instruction fetches are permitted.
    #[inline]
    #[must_use]
    pub const fn executable(self) -> bool {
        !self.no_execute()
    }
}
