//! Peripheral handles, and the traits every peripheral family implements
//!
//! A family (all UARTs, the USB device, ...) is one type. It implements
//! [`PowerGate`] to say how its ports are powered, and [`Driver`] to supply
//! its version, dispatch table, and transfer hooks. The provided `Driver`
//! methods are the family's public `open / ioctl / read / write / close`;
//! they forward into the [`shell`](crate::shell).

use crate::{
    ioctl::{IoctlFn, IoctlTable},
    shell,
    transfer::Transfer,
    Error,
};
use core::{any::Any, fmt};

/// Identifies one peripheral instance
///
/// A handle pairs a port number with the board's static configuration for
/// that port. The caller owns it; drivers never keep it.
pub struct Handle<C: 'static> {
    port: u8,
    config: &'static C,
}

impl<C: 'static> Handle<C> {
    pub const fn new(port: u8, config: &'static C) -> Self {
        Handle { port, config }
    }

    pub const fn port(&self) -> u8 {
        self.port
    }

    /// The board's static configuration for this port
    pub const fn config(&self) -> &'static C {
        self.config
    }
}

impl<C: 'static> Clone for Handle<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: 'static> Copy for Handle<C> {}

impl<C: 'static> fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("port", &self.port).finish()
    }
}

/// Power control for a peripheral family
///
/// The hardware (or state hidden in the driver) is the source of truth;
/// handles carry no power state.
///
/// `power_on` of a powered port, and `power_off` of an unpowered port,
/// must do nothing.
pub trait PowerGate {
    /// Static, per-port configuration supplied by the board
    type Config: 'static;

    /// The number of physical ports in this family
    ///
    /// Handles with a port at or above this number are rejected before
    /// any of the methods below are called.
    const PORT_COUNT: u8;

    fn is_powered(&self, handle: &Handle<Self::Config>) -> bool;
    fn power_on(&mut self, handle: &Handle<Self::Config>);
    fn power_off(&mut self, handle: &Handle<Self::Config>);
}

/// A device-specific transfer hook
pub type TransferFn<P> =
    fn(&mut P, &Handle<<P as PowerGate>::Config>, &mut Transfer<'_>) -> Result<usize, Error>;

/// A peripheral family's driver
pub trait Driver: PowerGate + Sized + 'static {
    /// The ident character for this family's request codes
    const IDENT: u8;
    /// Packed driver version, see [`version()`](crate::ioctl::version)
    const VERSION: u32;
    /// Ioctl handlers, indexed by request number
    const IOCTL: &'static [IoctlFn<Self>];

    /// Move data from the peripheral into the transfer
    ///
    /// Returns the number of bytes read. Returns 0 if nothing is available;
    /// if the transfer has a completion, the driver arms it and completes
    /// it once data arrives. The default is for write-only peripherals.
    fn device_read(
        &mut self,
        _handle: &Handle<Self::Config>,
        _transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        Err(Error::NotSupported)
    }

    /// Move data from the transfer to the peripheral
    ///
    /// Returns the number of bytes accepted. The default is for read-only
    /// peripherals.
    fn device_write(
        &mut self,
        _handle: &Handle<Self::Config>,
        _transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        Err(Error::NotSupported)
    }

    /// The dispatch table for this family
    fn ioctl_table() -> IoctlTable<'static, Self> {
        IoctlTable::new(Self::IDENT, Self::IOCTL)
    }

    /// Power the port, if it isn't already
    fn open(&mut self, handle: &Handle<Self::Config>) -> Result<(), Error> {
        shell::open(self, handle)
    }

    /// Run the control request on a powered port
    fn ioctl(
        &mut self,
        handle: &Handle<Self::Config>,
        request: u32,
        ctl: &mut dyn Any,
    ) -> Result<i32, Error> {
        shell::ioctl(self, handle, request, ctl, &Self::ioctl_table())
    }

    fn read(
        &mut self,
        handle: &Handle<Self::Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        shell::read(self, handle, transfer, Self::device_read)
    }

    fn write(
        &mut self,
        handle: &Handle<Self::Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        shell::write(self, handle, transfer, Self::device_write)
    }

    /// Power down the port
    ///
    /// There's no open count. One `close` powers the port down, even if
    /// someone else opened it too.
    fn close(&mut self, handle: &Handle<Self::Config>) -> Result<(), Error> {
        shell::close(self, handle)
    }
}

/// The handler at index 0 of every dispatch table
///
/// Returns the family's packed version, whatever the control structure.
pub fn get_version<P: Driver>(
    _: &mut P,
    _: &Handle<P::Config>,
    _: &mut dyn Any,
) -> Result<i32, Error> {
    Ok(P::VERSION as i32)
}

#[cfg(test)]
mod tests {
    use super::{get_version, Driver, Handle, PowerGate};
    use crate::{
        error::{LastError, EINVAL, ENOTSUP},
        ioctl::{self, IoctlFn, I_MCU_GETVERSION, I_MCU_TOTAL},
        transfer::Transfer,
        Error,
    };
    use core::any::Any;

    /// A read-only sensor, powered through a flag
    struct Sensor {
        powered: [bool; 2],
        sample: u8,
    }

    struct Config;
    static CONFIG: Config = Config;

    impl PowerGate for Sensor {
        type Config = Config;
        const PORT_COUNT: u8 = 2;
        fn is_powered(&self, handle: &Handle<Config>) -> bool {
            self.powered[handle.port() as usize]
        }
        fn power_on(&mut self, handle: &Handle<Config>) {
            self.powered[handle.port() as usize] = true;
        }
        fn power_off(&mut self, handle: &Handle<Config>) {
            self.powered[handle.port() as usize] = false;
        }
    }

    fn set_sample(sensor: &mut Sensor, _: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
        sensor.sample = *ctl.downcast_ref::<u8>().ok_or(Error::InvalidArgument)?;
        Ok(0)
    }

    fn unsupported(_: &mut Sensor, _: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
        Err(Error::NotSupported)
    }

    impl Driver for Sensor {
        const IDENT: u8 = b's';
        const VERSION: u32 = ioctl::version(1, 2, 0);
        const IOCTL: &'static [IoctlFn<Self>] = &{
            let table: [IoctlFn<Self>; I_MCU_TOTAL + 1] = [
                get_version::<Self>,
                unsupported,
                unsupported,
                unsupported,
                set_sample,
            ];
            table
        };

        fn device_read(
            &mut self,
            _: &Handle<Config>,
            transfer: &mut Transfer<'_>,
        ) -> Result<usize, Error> {
            let sample = self.sample;
            let destination = transfer.destination()?;
            destination.fill(sample);
            Ok(destination.len())
        }
    }

    #[test]
    fn version_through_the_family_ident() {
        let mut sensor = Sensor {
            powered: [false; 2],
            sample: 0,
        };
        let handle = Handle::new(1, &CONFIG);
        sensor.open(&handle).unwrap();

        let request = ioctl::io(b's', I_MCU_GETVERSION);
        assert_eq!(sensor.ioctl(&handle, request, &mut ()), Ok(0x0001_0200));
        assert_eq!(
            sensor.ioctl(&handle, ioctl::io(b'x', I_MCU_GETVERSION), &mut ()),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn read_only_peripheral() {
        let errno = LastError::new();
        let mut sensor = Sensor {
            powered: [false; 2],
            sample: 0,
        };
        let handle = Handle::new(0, &CONFIG);
        sensor.open(&handle).unwrap();

        let request = ioctl::iow(b's', I_MCU_TOTAL as u8, 1);
        assert_eq!(sensor.ioctl(&handle, request, &mut 0x42u8), Ok(0));
        assert_eq!(
            errno.status(sensor.ioctl(&handle, request, &mut 0x42u32)),
            -1
        );
        assert_eq!(errno.get(), EINVAL);

        let mut buffer = [0u8; 3];
        let mut transfer = Transfer::read(&mut buffer);
        assert_eq!(sensor.read(&handle, &mut transfer), Ok(3));
        assert_eq!(buffer, [0x42; 3]);

        let mut transfer = Transfer::write(&[1, 2, 3]);
        assert_eq!(errno.status(sensor.write(&handle, &mut transfer)), -1);
        assert_eq!(errno.get(), ENOTSUP);
    }

    #[test]
    fn port_out_of_range() {
        let mut sensor = Sensor {
            powered: [true; 2],
            sample: 0,
        };
        let handle = Handle::new(2, &CONFIG);
        assert_eq!(sensor.open(&handle), Err(Error::InvalidArgument));
        assert_eq!(
            sensor.ioctl(&handle, 0, &mut ()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(sensor.close(&handle), Err(Error::InvalidArgument));
    }
}
