//! # MMU Hardware Seam
//!
//! The walker edits tables in memory; everything that touches a system
//! register or the TLB goes through [`MmuHardware`]. Native implementations
//! are compiled only for their own `target_arch`, hosted tests substitute a
//! recording double.
//!
//! | Operation           | RISC-V                 | ARM64                         | ARMv7 LPAE                 |
//! |:--------------------|:-----------------------|:------------------------------|:---------------------------|
//! | `install_root`      | `csrw satp`            | `msr ttbr0_el1`, clear `EPD0` | `mcrr p15,0,..,c2`         |
//! | `disable_user_root` | (single root)          | set `TCR_EL1.EPD0`            | set `TTBCR.EPD0`           |
//! | `flush_page`        | `sfence.vma va, asid`  | `tlbi vae1is` / `vaae1is`     | `TLBIMVAIS` / `TLBIMVAAIS` |
//! | `flush_asid`        | `sfence.vma x0, asid`  | `tlbi aside1is`               | `TLBIASIDIS`               |
//! | `flush_all`         | `sfence.vma`           | `tlbi vmalle1is`              | `TLBIALLIS`                |
//!
//! Every operation ends with the architecture's completion barrier, so the
//! new translation is in effect when the call returns.

use kernel_memory_addresses::VirtualAddress;

/// Root-register and TLB maintenance for one CPU architecture.
pub trait MmuHardware {
    /// Write `value` (as built by
    /// [`PageTableFormat::root_register`](crate::PageTableFormat::root_register))
    /// to the user/active translation-root register.
    ///
    /// # Safety
    /// The root must describe a valid tree that keeps the running code mapped.
    unsafe fn install_root(&self, value: u64);

    /// Stop translating the user half (split-root formats only).
    ///
    /// # Safety
    /// Nothing in the user half may be accessed afterwards.
    unsafe fn disable_user_root(&self);

    /// Invalidate the translation of one page, optionally only for `asid`.
    fn flush_page(&self, va: VirtualAddress, asid: Option<u16>);

    /// Invalidate every non-global translation tagged with `asid`.
    fn flush_asid(&self, asid: u16);

    /// Invalidate the whole TLB.
    fn flush_all(&self);
}

impl<T: MmuHardware + ?Sized> MmuHardware for &T {
    unsafe fn install_root(&self, value: u64) {
        unsafe { (**self).install_root(value) }
    }

    unsafe fn disable_user_root(&self) {
        unsafe { (**self).disable_user_root() }
    }

    fn flush_page(&self, va: VirtualAddress, asid: Option<u16>) {
        (**self).flush_page(va, asid);
    }

    fn flush_asid(&self, asid: u16) {
        (**self).flush_asid(asid);
    }

    fn flush_all(&self) {
        (**self).flush_all();
    }
}

#[cfg(target_arch = "riscv64")]
pub use riscv::RiscvHart;

#[cfg(target_arch = "riscv64")]
pub type NativeHardware = RiscvHart;

#[cfg(target_arch = "riscv64")]
mod riscv {
    use super::MmuHardware;
    use core::arch::asm;
    use kernel_memory_addresses::VirtualAddress;
    use log::error;

    /// The current hart's `satp` and `sfence.vma`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RiscvHart;

    impl MmuHardware for RiscvHart {
        unsafe fn install_root(&self, value: u64) {
            unsafe {
                asm!("csrw satp, {0}", "sfence.vma", in(reg) value, options(nostack));
            }
        }

        unsafe fn disable_user_root(&self) {
            error!("satp has no separate user root");
            panic!("disable_user_root on a single-root MMU");
        }

        fn flush_page(&self, va: VirtualAddress, asid: Option<u16>) {
            let va = va.as_u64();
            // SAFETY: TLB maintenance has no memory effects.
            unsafe {
                match asid {
                    Some(asid) => {
                        asm!("sfence.vma {0}, {1}", in(reg) va, in(reg) u64::from(asid), options(nostack));
                    }
                    None => asm!("sfence.vma {0}, zero", in(reg) va, options(nostack)),
                }
            }
        }

        fn flush_asid(&self, asid: u16) {
            // SAFETY: see above.
            unsafe {
                asm!("sfence.vma zero, {0}", in(reg) u64::from(asid), options(nostack));
            }
        }

        fn flush_all(&self) {
            // SAFETY: see above.
            unsafe {
                asm!("sfence.vma", options(nostack));
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub use aarch64::Aarch64Cpu;

#[cfg(target_arch = "aarch64")]
pub type NativeHardware = Aarch64Cpu;

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    use super::MmuHardware;
    use core::arch::asm;
    use kernel_memory_addresses::VirtualAddress;

    /// `TCR_EL1.EPD0`: walks through `TTBR0_EL1` fault.
    const TCR_EPD0: u64 = 1 << 7;

    /// EL1 translation registers and inner-shareable TLB maintenance.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Aarch64Cpu;

    impl Aarch64Cpu {
        unsafe fn update_tcr(set: u64, clear: u64) {
            unsafe {
                let mut tcr: u64;
                asm!("mrs {0}, tcr_el1", out(reg) tcr, options(nomem, nostack));
                tcr = (tcr & !clear) | set;
                asm!("msr tcr_el1, {0}", "isb", in(reg) tcr, options(nostack));
            }
        }

        fn complete() {
            // SAFETY: barriers only.
            unsafe {
                asm!("dsb ish", "isb", options(nostack));
            }
        }
    }

    impl MmuHardware for Aarch64Cpu {
        unsafe fn install_root(&self, value: u64) {
            unsafe {
                asm!("msr ttbr0_el1, {0}", "isb", in(reg) value, options(nostack));
                Self::update_tcr(0, TCR_EPD0);
            }
        }

        unsafe fn disable_user_root(&self) {
            unsafe { Self::update_tcr(TCR_EPD0, 0) }
        }

        fn flush_page(&self, va: VirtualAddress, asid: Option<u16>) {
            let page = (va.as_u64() >> 12) & ((1 << 44) - 1);
            // SAFETY: TLB maintenance has no memory effects.
            unsafe {
                asm!("dsb ishst", options(nostack));
                match asid {
                    Some(asid) => {
                        let arg = (u64::from(asid) << 48) | page;
                        asm!("tlbi vae1is, {0}", in(reg) arg, options(nostack));
                    }
                    None => asm!("tlbi vaae1is, {0}", in(reg) page, options(nostack)),
                }
            }
            Self::complete();
        }

        fn flush_asid(&self, asid: u16) {
            // SAFETY: see above.
            unsafe {
                asm!("dsb ishst", "tlbi aside1is, {0}", in(reg) u64::from(asid) << 48, options(nostack));
            }
            Self::complete();
        }

        fn flush_all(&self) {
            // SAFETY: see above.
            unsafe {
                asm!("dsb ishst", "tlbi vmalle1is", options(nostack));
            }
            Self::complete();
        }
    }
}

#[cfg(target_arch = "arm")]
pub use arm::ArmCp15;

#[cfg(target_arch = "arm")]
pub type NativeHardware = ArmCp15;

#[cfg(target_arch = "arm")]
mod arm {
    use super::MmuHardware;
    use core::arch::asm;
    use kernel_memory_addresses::VirtualAddress;

    /// `TTBCR.EPD0`: walks through `TTBR0` fault.
    const TTBCR_EPD0: u32 = 1 << 7;

    /// CP15 translation registers of an ARMv7-A core with LPAE.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ArmCp15;

    impl ArmCp15 {
        unsafe fn update_ttbcr(set: u32, clear: u32) {
            unsafe {
                let mut ttbcr: u32;
                asm!("mrc p15, 0, {0}, c2, c0, 2", out(reg) ttbcr, options(nomem, nostack));
                ttbcr = (ttbcr & !clear) | set;
                asm!("mcr p15, 0, {0}, c2, c0, 2", "isb", in(reg) ttbcr, options(nostack));
            }
        }

        fn complete() {
            // SAFETY: barriers only.
            unsafe {
                asm!("dsb ish", "isb", options(nostack));
            }
        }
    }

    impl MmuHardware for ArmCp15 {
        unsafe fn install_root(&self, value: u64) {
            #[allow(clippy::cast_possible_truncation)]
            let (lo, hi) = (value as u32, (value >> 32) as u32);
            unsafe {
                asm!("mcrr p15, 0, {0}, {1}, c2", "isb", in(reg) lo, in(reg) hi, options(nostack));
                Self::update_ttbcr(0, TTBCR_EPD0);
            }
        }

        unsafe fn disable_user_root(&self) {
            unsafe { Self::update_ttbcr(TTBCR_EPD0, 0) }
        }

        fn flush_page(&self, va: VirtualAddress, asid: Option<u16>) {
            #[allow(clippy::cast_possible_truncation)]
            let mva = (va.as_u64() as u32) & !0xFFF;
            // SAFETY: TLB maintenance has no memory effects.
            unsafe {
                match asid {
                    Some(asid) => {
                        let arg = mva | u32::from(asid & 0xFF);
                        asm!("mcr p15, 0, {0}, c8, c3, 1", in(reg) arg, options(nostack));
                    }
                    None => asm!("mcr p15, 0, {0}, c8, c3, 3", in(reg) mva, options(nostack)),
                }
            }
            Self::complete();
        }

        fn flush_asid(&self, asid: u16) {
            // SAFETY: see above.
            unsafe {
                asm!("mcr p15, 0, {0}, c8, c3, 2", in(reg) u32::from(asid & 0xFF), options(nostack));
            }
            Self::complete();
        }

        fn flush_all(&self) {
            // SAFETY: see above.
            unsafe {
                asm!("mcr p15, 0, {0}, c8, c3, 0", in(reg) 0_u32, options(nostack));
            }
            Self::complete();
        }
    }
}
