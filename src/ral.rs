//! Register access helpers
//!
//! Peripheral register blocks in this crate are `#[repr(C)]` structs of
//! [`VCell`]s, paired with field modules that follow the RAL convention
//! (`offset`, `mask`, and `R` / `W` / `RW` value modules). That lets us
//! use the `ral-registers` macros on them, and lets the unit tests back
//! a register block with ordinary memory.

use core::{cell::UnsafeCell, marker::PhantomData, ops::Deref, ptr::NonNull};

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Volatile cell that conforms to the RAL's register API
#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    /// Firmware never creates registers; tests back register blocks
    /// with memory.
    #[cfg(test)]
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    #[inline(always)]
    pub fn read(&self) -> T {
        // Safety: the cell is the only way to reach this memory.
        unsafe { self.0.get().read_volatile() }
    }
    #[inline(always)]
    pub fn write(&self, val: T) {
        // Safety: see read().
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// A register block at a fixed address
///
/// Dereferences to the register block `RB`. Drivers store `Instance`s
/// instead of references so that they can be moved into `static`s and
/// shared with interrupt handlers.
pub struct Instance<RB> {
    ptr: NonNull<RB>,
    _rb: PhantomData<RB>,
}

impl<RB> Instance<RB> {
    /// Wrap the register block at `addr`
    ///
    /// Returns `None` if `addr` is null.
    ///
    /// # Safety
    ///
    /// `addr` must point to a register block of type `RB` that stays valid
    /// for as long as the instance exists. The caller must make sure that
    /// no other driver owns the same block.
    pub unsafe fn new(addr: *const ()) -> Option<Self> {
        NonNull::new(addr as *mut RB).map(|ptr| Instance {
            ptr,
            _rb: PhantomData,
        })
    }
}

impl<RB> Deref for Instance<RB> {
    type Target = RB;
    fn deref(&self) -> &RB {
        // Safety: non-null, and valid per the contract of new().
        unsafe { self.ptr.as_ref() }
    }
}

// Safety: an instance is a uniquely-owned handle to MMIO. Moving it
// to another context moves the ownership with it.
unsafe impl<RB> Send for Instance<RB> {}

#[cfg(test)]
mod tests {
    use super::{Instance, VCell};

    #[repr(C)]
    #[allow(non_snake_case)]
    struct Block {
        CTRL: VCell<u32>,
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    mod CTRL {
        pub mod EN {
            pub const offset: u32 = 3;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[test]
    fn null_instance() {
        assert!(unsafe { Instance::<Block>::new(core::ptr::null()) }.is_none());
    }

    #[test]
    fn instance_derefs_to_block() {
        let block = Block {
            CTRL: VCell::new(0),
        };
        let inst = unsafe { Instance::<Block>::new(&block as *const _ as *const ()) }.unwrap();

        super::write_reg!(self, inst, CTRL, EN: 1);
        assert_eq!(block.CTRL.read(), 1 << 3);
        assert!(super::read_reg!(self, inst, CTRL, EN == 1));
    }
}
