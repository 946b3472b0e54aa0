//! Drivers shared between task code and interrupt handlers

use crate::{
    driver::{Driver, Handle},
    transfer::Transfer,
    Error,
};
use core::{any::Any, cell::RefCell};
use cortex_m::interrupt::{self, Mutex};

/// A driver behind a critical section
///
/// Put one in a `static`, and reach the driver from task code and from the
/// peripheral's interrupt handler. Every access disables interrupts for its
/// duration, so keep blocking writes short.
///
/// ```no_run
/// use mcu_periph::{shared::Shared, uart::Uart};
///
/// static UART: Shared<Uart> = Shared::new();
///
/// fn uart_isr() {
///     UART.with_driver_mut(|uart| uart.on_interrupt(0));
/// }
/// ```
pub struct Shared<D> {
    driver: Mutex<RefCell<Option<D>>>,
}

impl<D> Shared<D> {
    /// An empty slot; [`init()`](Shared::init) it before use
    pub const fn new() -> Self {
        Shared {
            driver: Mutex::new(RefCell::new(None)),
        }
    }

    /// Install the driver, returning the one it replaces
    pub fn init(&self, driver: D) -> Option<D> {
        interrupt::free(|cs| self.driver.borrow(cs).replace(Some(driver)))
    }

    /// Interrupt-safe, immutable access to the driver
    ///
    /// Returns `None` if there's no driver.
    pub fn with_driver<R>(&self, func: impl FnOnce(&D) -> R) -> Option<R> {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let driver = driver.borrow();
            driver.as_ref().map(func)
        })
    }

    /// Interrupt-safe, mutable access to the driver
    ///
    /// Returns `None` if there's no driver.
    pub fn with_driver_mut<R>(&self, func: impl FnOnce(&mut D) -> R) -> Option<R> {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let mut driver = driver.borrow_mut();
            driver.as_mut().map(func)
        })
    }
}

impl<D: Driver> Shared<D> {
    fn run<R>(&self, op: impl FnOnce(&mut D) -> Result<R, Error>) -> Result<R, Error> {
        installed(self.with_driver_mut(op))
    }

    pub fn open(&self, handle: &Handle<D::Config>) -> Result<(), Error> {
        self.run(|driver| driver.open(handle))
    }

    pub fn ioctl(
        &self,
        handle: &Handle<D::Config>,
        request: u32,
        ctl: &mut dyn Any,
    ) -> Result<i32, Error> {
        self.run(|driver| driver.ioctl(handle, request, ctl))
    }

    pub fn read(
        &self,
        handle: &Handle<D::Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        self.run(|driver| driver.read(handle, transfer))
    }

    pub fn write(
        &self,
        handle: &Handle<D::Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        self.run(|driver| driver.write(handle, transfer))
    }

    pub fn close(&self, handle: &Handle<D::Config>) -> Result<(), Error> {
        self.run(|driver| driver.close(handle))
    }
}

impl<D> Default for Shared<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of an operation, if a driver ran it; `NotSupported` if not
fn installed<R>(result: Option<Result<R, Error>>) -> Result<R, Error> {
    result.unwrap_or(Err(Error::NotSupported))
}
