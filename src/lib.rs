//! Uniform drivers for MCU peripherals
//!
//! Every peripheral family (the UARTs, the USB device, ...) exposes the
//! same five operations: `open`, `ioctl`, `read`, `write`, and `close`.
//! A [`Handle`] selects the port, and carries the board's static
//! configuration for it. Control requests are dispatched through a
//! per-family table of handlers, where request 0 always returns the driver
//! version. See the [`ioctl`] module for request codes, and the
//! [`transfer`] module for reads and writes that complete later.
//!
//! The generic checks (port range, power state, request lookup) live in
//! the [`shell`]. Families implement [`PowerGate`] and [`Driver`], and
//! inherit the five operations.
//!
//! To give the drivers their registers, you must define a safe
//! implementation of [`Peripherals`]. See the peripherals documentation for
//! more information.
//!
//! # Errors
//!
//! Operations return `Result`s carrying an [`Error`]. Use a [`LastError`]
//! slot to convert them into `int` status codes with an `errno`.

#![no_std]

#[macro_use]
mod log;

mod ral;

pub mod driver;
pub mod error;
pub mod ioctl;
pub mod power;
pub mod shared;
pub mod shell;
pub mod transfer;
pub mod uart;
pub mod usb;

pub use driver::{Driver, Handle, PowerGate};
pub use error::{Error, LastError};
pub use transfer::{Completion, Transfer};

/// A type that owns peripheral register blocks
///
/// An implementation of `Peripherals` is expected to own
///
/// - the power (or clock) enable register
/// - the UART register blocks
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the register blocks it hands out. The pointers returned by the
/// methods are assumed to be valid, and will be cast to a register
/// definition. Drivers that share the power register each perform
/// read-modify-writes on it; don't enable or disable ports of different
/// families concurrently.
///
/// # Example
///
/// A safe implementation of `Peripherals` for an LPC1769.
///
/// ```
/// use mcu_periph::Peripherals;
///
/// /// Panics if constructed twice
/// struct Lpc1769(());
///
/// impl Lpc1769 {
///     fn take() -> Self {
///         use core::sync::atomic::{AtomicBool, Ordering};
///         static TAKEN: AtomicBool = AtomicBool::new(false);
///         assert!(!TAKEN.swap(true, Ordering::SeqCst));
///         Lpc1769(())
///     }
/// }
///
/// unsafe impl Peripherals for Lpc1769 {
///     fn power(&self) -> *const () {
///         0x400F_C0C4 as *const ()
///     }
///     fn uart(&self, port: u8) -> Option<*const ()> {
///         [0x4000_C000, 0x4001_0000, 0x4009_8000, 0x4009_C000]
///             .get(port as usize)
///             .map(|&addr| addr as *const ())
///     }
/// }
///
/// let lpc = Lpc1769::take();
/// assert_eq!(lpc.uart(2), Some(0x4009_8000 as *const ()));
/// assert_eq!(lpc.uart(4), None);
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the peripheral power / clock enable register
    fn power(&self) -> *const ();
    /// Returns the address of the register block for UART `port`
    ///
    /// The default has no UARTs.
    fn uart(&self, _port: u8) -> Option<*const ()> {
        None
    }
}
