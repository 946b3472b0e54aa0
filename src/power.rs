//! Peripheral power and clock gating
//!
//! LPC1xxx parts gate every peripheral through one bit in `PCONP`.
//! STM32F4xx parts do the same with the `RCC_AHBxENR` / `RCC_APBxENR`
//! clock enable registers. [`PowerControl`] wraps one such register, and
//! the peripheral families map their ports to its bits.

use crate::ral;

#[allow(non_snake_case, non_upper_case_globals)]
pub(crate) mod regs {
    use crate::ral::VCell;

    #[repr(C)]
    pub struct RegisterBlock {
        /// One enable bit per peripheral instance
        pub PCONP: VCell<u32>,
    }

    pub mod PCONP {}

    #[cfg(test)]
    impl RegisterBlock {
        pub const fn new() -> Self {
            RegisterBlock {
                PCONP: VCell::new(0),
            }
        }
    }
}

/// A peripheral power / clock enable register
pub struct PowerControl {
    regs: ral::Instance<regs::RegisterBlock>,
}

impl PowerControl {
    /// Wrap the enable register at `addr`
    ///
    /// Returns `None` if `addr` is null.
    ///
    /// # Safety
    ///
    /// `addr` must be the address of a 32-bit power or clock enable register.
    /// Every `PowerControl` over the same register performs unsynchronized
    /// read-modify-writes, so callers must serialize `enable()` and
    /// `disable()` calls across them (for instance, by only calling them
    /// from task context).
    pub unsafe fn new(addr: *const ()) -> Option<Self> {
        ral::Instance::new(addr).map(|regs| PowerControl { regs })
    }

    /// Indicates if the peripheral behind `bit` is powered
    pub fn is_enabled(&self, bit: u32) -> bool {
        (ral::read_reg!(crate::power::regs, self.regs, PCONP) & mask(bit)) != 0
    }

    /// Power the peripheral behind `bit`
    pub fn enable(&self, bit: u32) {
        let pconp = ral::read_reg!(crate::power::regs, self.regs, PCONP);
        ral::write_reg!(crate::power::regs, self.regs, PCONP, pconp | mask(bit));
        trace!("PCONP SET {}", bit);
    }

    /// Power down the peripheral behind `bit`
    pub fn disable(&self, bit: u32) {
        let pconp = ral::read_reg!(crate::power::regs, self.regs, PCONP);
        ral::write_reg!(crate::power::regs, self.regs, PCONP, pconp & !mask(bit));
        trace!("PCONP CLR {}", bit);
    }

    #[cfg(test)]
    pub(crate) fn register(&self) -> &ral::VCell<u32> {
        &self.regs.PCONP
    }
}

const fn mask(bit: u32) -> u32 {
    1 << (bit & 31)
}
