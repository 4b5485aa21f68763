//! Concrete [`PageTableFormat`](crate::PageTableFormat)s.
//!
//! Every format is compiled on every target so the encodings can be tested on
//! the host; [`NativeFormat`] names the one the current target runs.

mod arm;
mod riscv;

pub use arm::{Arm64, ArmLpae, LongDescriptor};
pub use riscv::{RiscvPte, Sv39, Sv48};

#[cfg(all(target_arch = "riscv64", not(feature = "sv48")))]
pub type NativeFormat = Sv39;

#[cfg(all(target_arch = "riscv64", feature = "sv48"))]
pub type NativeFormat = Sv48;

#[cfg(target_arch = "aarch64")]
pub type NativeFormat = Arm64;

#[cfg(target_arch = "arm")]
pub type NativeFormat = ArmLpae;
