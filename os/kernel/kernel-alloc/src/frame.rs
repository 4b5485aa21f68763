use crate::free_list::NIL;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Largest reference count a frame can hold (24 bits).
pub const MAX_REF_COUNT: u32 = (1 << 24) - 1;

/// Allocation metadata of one physical frame, packed into 32 bits.
///
/// ```text
/// | 31 ........ 8 | 7 .... 1 |   0    |
/// |   ref_count   | reserved | in_use |
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FrameState {
    /// Owned by someone other than the arena (not on the free list).
    pub in_use: bool,

    #[bits(7)]
    __reserved: u8,

    /// References held on the frame. Page-table frames count their live
    /// entries here.
    #[bits(24)]
    pub ref_count: u32,
}

/// One entry of an arena's frame table: metadata plus free-list links.
///
/// The links are indices into the same table; [`NIL`] terminates the list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub(crate) state: FrameState,
    pub(crate) prev: u32,
    pub(crate) next: u32,
}

impl Frame {
    pub(crate) const fn free() -> Self {
        Self {
            state: FrameState::new(),
            prev: NIL,
            next: NIL,
        }
    }
}

/// Read-only snapshot of a frame's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub address: PhysicalAddress,
    pub in_use: bool,
    pub ref_count: u32,
}
