//! Hart identity and interrupt control.
//!
//! The allocators never talk to the hardware directly. Everything they need
//! to know about the hart they are running on goes through [`Harts`], so the
//! same code runs on the kernel target and inside host unit tests.

/// Access to the hart the caller is currently running on.
pub trait Harts: Sync {
    /// Returns the id of the hart this function is called on.
    ///
    /// The id is used to index per-CPU data and must be below [`NCPU`](crate::mem::NCPU).
    fn hart_id(&self) -> usize;

    /// Disables interrupts on the current hart.
    ///
    /// Returns whether interrupts were enabled before.
    fn disable_interrupts(&self) -> bool;

    /// Restores the interrupt state returned by [`disable_interrupts`](Harts::disable_interrupts).
    fn restore_interrupts(&self, enabled: bool);
}

#[cfg(target_arch = "riscv64")]
pub use self::riscv::Riscv;

#[cfg(target_arch = "riscv64")]
mod riscv {
    use core::arch::asm;

    /// The `SIE` bit inside `sstatus`.
    const SSTATUS_SIE: usize = 1 << 1;

    /// [`Harts`](super::Harts) implementation for a RISC-V kernel running in supervisor mode.
    ///
    /// The boot code is expected to store the hart id inside the `tp` register.
    pub struct Riscv;

    impl super::Harts for Riscv {
        #[inline(always)]
        fn hart_id(&self) -> usize {
            let id: usize;
            unsafe { asm!("mv {}, tp", out(reg) id, options(nomem, nostack)) }
            id
        }

        #[inline(always)]
        fn disable_interrupts(&self) -> bool {
            let sstatus: usize;
            unsafe { asm!("csrrci {}, sstatus, 2", out(reg) sstatus, options(nostack)) }
            sstatus & SSTATUS_SIE != 0
        }

        #[inline(always)]
        fn restore_interrupts(&self, enabled: bool) {
            if enabled {
                unsafe { asm!("csrsi sstatus, 2", options(nostack)) }
            }
        }
    }
}
