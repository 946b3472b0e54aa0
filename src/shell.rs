//! The generic driver shell
//!
//! Every peripheral family's `open / ioctl / read / write / close` lands
//! here, parameterized by the family's power gate, dispatch table, and
//! transfer hooks. The shell enforces the port range and the power state,
//! then delegates. It keeps no state, doesn't buffer, doesn't retry, and
//! doesn't log.
//!
//! All checks run before a hook is called, so a request that fails here
//! leaves the hardware untouched.

use crate::{
    driver::{Handle, PowerGate, TransferFn},
    ioctl::IoctlTable,
    transfer::Transfer,
    Error,
};
use core::any::Any;

fn check_port<P: PowerGate>(handle: &Handle<P::Config>) -> Result<(), Error> {
    if handle.port() < P::PORT_COUNT {
        Ok(())
    } else {
        Err(Error::InvalidArgument)
    }
}

fn check_powered<P: PowerGate>(dev: &P, handle: &Handle<P::Config>) -> Result<(), Error> {
    check_port::<P>(handle)?;
    if dev.is_powered(handle) {
        Ok(())
    } else {
        Err(Error::NotSupported)
    }
}

/// Power on the port, unless it's already on
pub fn open<P: PowerGate>(dev: &mut P, handle: &Handle<P::Config>) -> Result<(), Error> {
    check_port::<P>(handle)?;
    if !dev.is_powered(handle) {
        dev.power_on(handle);
    }
    Ok(())
}

/// Dispatch `request` through `table`
///
/// Fails with `NotSupported` if the port is unpowered, and with
/// `InvalidArgument` if the table has no handler for `request`. Otherwise,
/// returns the handler's result as-is.
pub fn ioctl<P: PowerGate>(
    dev: &mut P,
    handle: &Handle<P::Config>,
    request: u32,
    ctl: &mut dyn Any,
    table: &IoctlTable<'_, P>,
) -> Result<i32, Error> {
    check_powered(dev, handle)?;
    let handler = table.resolve(request)?;
    handler(dev, handle, ctl)
}

/// Read through `device_read` from a powered port
pub fn read<P: PowerGate>(
    dev: &mut P,
    handle: &Handle<P::Config>,
    transfer: &mut Transfer<'_>,
    device_read: TransferFn<P>,
) -> Result<usize, Error> {
    check_powered(dev, handle)?;
    device_read(dev, handle, transfer)
}

/// Write through `device_write` to a powered port
pub fn write<P: PowerGate>(
    dev: &mut P,
    handle: &Handle<P::Config>,
    transfer: &mut Transfer<'_>,
    device_write: TransferFn<P>,
) -> Result<usize, Error> {
    check_powered(dev, handle)?;
    device_write(dev, handle, transfer)
}

/// Power off the port, if it's on
///
/// There's no open count: a port that's shared by several openers goes
/// down on the first close.
pub fn close<P: PowerGate>(dev: &mut P, handle: &Handle<P::Config>) -> Result<(), Error> {
    check_port::<P>(handle)?;
    if dev.is_powered(handle) {
        dev.power_off(handle);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::get_version,
        error::{LastError, EINVAL, ENOTSUP},
        ioctl::IoctlFn,
    };

    struct Config;
    static CONFIG: Config = Config;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Attr {
        freq: u32,
    }

    /// Instrumented peripheral with a loop-back buffer
    struct Mock {
        powered: bool,
        /// Simulates hardware that can't be powered down
        always_on: bool,
        power_on_calls: usize,
        power_off_calls: usize,
        handler_calls: [usize; 6],
        device_calls: usize,
        last_attr: Option<Attr>,
        loopback: [u8; 16],
        loopback_len: usize,
    }

    impl Mock {
        fn new() -> Self {
            Mock {
                powered: false,
                always_on: false,
                power_on_calls: 0,
                power_off_calls: 0,
                handler_calls: [0; 6],
                device_calls: 0,
                last_attr: None,
                loopback: [0; 16],
                loopback_len: 0,
            }
        }
        fn always_on() -> Self {
            Mock {
                powered: true,
                always_on: true,
                ..Mock::new()
            }
        }
    }

    impl PowerGate for Mock {
        type Config = Config;
        const PORT_COUNT: u8 = 1;
        fn is_powered(&self, _: &Handle<Config>) -> bool {
            self.powered
        }
        fn power_on(&mut self, _: &Handle<Config>) {
            self.power_on_calls += 1;
            self.powered = true;
        }
        fn power_off(&mut self, _: &Handle<Config>) {
            self.power_off_calls += 1;
            self.powered = self.always_on;
        }
    }

    impl crate::Driver for Mock {
        const IDENT: u8 = b'm';
        const VERSION: u32 = crate::ioctl::version(2, 1, 0);
        const IOCTL: &'static [IoctlFn<Self>] = &TABLE;
    }

    fn count(mock: &mut Mock, index: usize) -> Result<i32, Error> {
        mock.handler_calls[index] += 1;
        Ok(0)
    }
    fn h1(m: &mut Mock, _: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
        count(m, 1)
    }
    fn h2(m: &mut Mock, _: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
        count(m, 2)
    }
    fn h3(m: &mut Mock, _: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
        count(m, 3)?;
        let attr = ctl.downcast_ref::<Attr>().ok_or(Error::InvalidArgument)?;
        m.last_attr = Some(*attr);
        Ok(0x5a5a)
    }
    fn h4(m: &mut Mock, _: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
        count(m, 4)
    }
    fn h5(m: &mut Mock, _: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
        count(m, 5)?;
        Err(Error::NotSupported)
    }

    const TABLE: [IoctlFn<Mock>; 6] = [get_version::<Mock>, h1, h2, h3, h4, h5];

    fn loopback_write(
        m: &mut Mock,
        _: &Handle<Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        m.device_calls += 1;
        let source = transfer.source()?;
        let len = source.len().min(m.loopback.len());
        m.loopback[..len].copy_from_slice(&source[..len]);
        m.loopback_len = len;
        Ok(len)
    }

    fn loopback_read(
        m: &mut Mock,
        _: &Handle<Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        m.device_calls += 1;
        let destination = transfer.destination()?;
        let len = destination.len().min(m.loopback_len);
        destination[..len].copy_from_slice(&m.loopback[..len]);
        Ok(len)
    }

    fn table() -> IoctlTable<'static, Mock> {
        IoctlTable::new(b'm', &TABLE)
    }

    #[test]
    fn open_is_idempotent() {
        let mut mock = Mock::new();
        let handle = Handle::new(0, &CONFIG);
        open(&mut mock, &handle).unwrap();
        open(&mut mock, &handle).unwrap();
        assert_eq!(mock.power_on_calls, 1);
        assert!(mock.powered);
    }

    #[test]
    fn close_after_open_powers_off() {
        let mut mock = Mock::new();
        let handle = Handle::new(0, &CONFIG);
        open(&mut mock, &handle).unwrap();
        close(&mut mock, &handle).unwrap();
        assert!(!mock.is_powered(&handle));
        assert_eq!(mock.power_off_calls, 1);

        // Already off; nothing to do.
        close(&mut mock, &handle).unwrap();
        assert_eq!(mock.power_off_calls, 1);
    }

    #[test]
    fn close_has_no_open_count() {
        let mut mock = Mock::new();
        let handle = Handle::new(0, &CONFIG);
        open(&mut mock, &handle).unwrap();
        open(&mut mock, &handle).unwrap();
        close(&mut mock, &handle).unwrap();
        assert!(!mock.powered);
    }

    #[test]
    fn version_ignores_ctl() {
        let mut mock = Mock::always_on();
        let handle = Handle::new(0, &CONFIG);
        let expected = Ok(0x0002_0100);
        assert_eq!(ioctl(&mut mock, &handle, 0, &mut (), &table()), expected);
        assert_eq!(
            ioctl(&mut mock, &handle, 0, &mut Attr { freq: 9600 }, &table()),
            expected
        );
        assert_eq!(ioctl(&mut mock, &handle, 0, &mut [0u8; 4], &table()), expected);
        assert_eq!(mock.handler_calls, [0; 6]);
    }

    #[test]
    fn dispatches_to_handler_once() {
        let mut mock = Mock::always_on();
        let handle = Handle::new(0, &CONFIG);
        let mut attr = Attr { freq: 115_200 };

        assert_eq!(ioctl(&mut mock, &handle, 3, &mut attr, &table()), Ok(0x5a5a));
        assert_eq!(mock.handler_calls, [0, 0, 0, 1, 0, 0]);
        assert_eq!(mock.last_attr, Some(attr));
    }

    #[test]
    fn handler_errors_pass_through() {
        let errno = LastError::new();
        let mut mock = Mock::always_on();
        let handle = Handle::new(0, &CONFIG);
        assert_eq!(errno.status(ioctl(&mut mock, &handle, 5, &mut (), &table())), -1);
        assert_eq!(errno.get(), ENOTSUP);
        assert_eq!(mock.handler_calls[5], 1);
    }

    #[test]
    fn request_past_the_table() {
        let errno = LastError::new();
        let mut mock = Mock::always_on();
        let handle = Handle::new(0, &CONFIG);
        for request in [6, 7, 0xFF, crate::ioctl::io(b'm', 6), 0x0103] {
            errno.clear();
            let result = ioctl(&mut mock, &handle, request, &mut (), &table());
            assert_eq!(errno.status(result), -1);
            assert_eq!(errno.get(), EINVAL);
        }
        assert_eq!(mock.handler_calls, [0; 6]);
    }

    #[test]
    fn unpowered_rejects_everything() {
        let errno = LastError::new();
        let mut mock = Mock::new();
        let handle = Handle::new(0, &CONFIG);

        for request in 0..6 {
            errno.clear();
            let result = ioctl(&mut mock, &handle, request, &mut (), &table());
            assert_eq!(errno.status(result), -1);
            assert_eq!(errno.get(), ENOTSUP);
        }

        let mut buffer = [0u8; 4];
        let mut transfer = Transfer::read(&mut buffer);
        errno.clear();
        let result = read(&mut mock, &handle, &mut transfer, loopback_read);
        assert_eq!(errno.status(result), -1);
        assert_eq!(errno.get(), ENOTSUP);

        let mut transfer = Transfer::write(&[1, 2, 3, 4]);
        errno.clear();
        let result = write(&mut mock, &handle, &mut transfer, loopback_write);
        assert_eq!(errno.status(result), -1);
        assert_eq!(errno.get(), ENOTSUP);

        assert_eq!(mock.handler_calls, [0; 6]);
        assert_eq!(mock.device_calls, 0);
        assert_eq!(mock.power_on_calls, 0);
    }

    #[test]
    fn loopback_round_trip() {
        let mut mock = Mock::new();
        let handle = Handle::new(0, &CONFIG);
        open(&mut mock, &handle).unwrap();

        let empty: [u8; 0] = [];
        let one = [0xA5];
        let many = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x7F];
        for data in [&empty[..], &one[..], &many[..]] {
            let mut transfer = Transfer::write(data);
            assert_eq!(
                write(&mut mock, &handle, &mut transfer, loopback_write),
                Ok(data.len())
            );

            let mut buffer = [0u8; 16];
            let mut transfer = Transfer::read(&mut buffer[..data.len()]);
            assert_eq!(
                read(&mut mock, &handle, &mut transfer, loopback_read),
                Ok(data.len())
            );
            assert_eq!(&buffer[..data.len()], data);
        }
    }

    #[test]
    fn port_checked_before_power() {
        let mut mock = Mock::new();
        let handle = Handle::new(1, &CONFIG);
        assert_eq!(open(&mut mock, &handle), Err(Error::InvalidArgument));
        assert_eq!(mock.power_on_calls, 0);

        let mut transfer = Transfer::write(&[1]);
        assert_eq!(
            write(&mut mock, &handle, &mut transfer, loopback_write),
            Err(Error::InvalidArgument)
        );
        assert_eq!(mock.device_calls, 0);
    }

    #[test]
    fn driver_wrappers_forward_to_the_shell() {
        use crate::Driver;

        let mut mock = Mock::new();
        let handle = Handle::new(0, &CONFIG);
        mock.open(&handle).unwrap();
        mock.open(&handle).unwrap();
        assert_eq!(mock.power_on_calls, 1);

        assert_eq!(Mock::ioctl_table().len(), 6);
        assert_eq!(
            mock.ioctl(&handle, crate::ioctl::io(b'm', 3), &mut Attr { freq: 1 }),
            Ok(0x5a5a)
        );

        // No transfer hooks: the defaults decline.
        let mut transfer = Transfer::write(&[1]);
        assert_eq!(mock.write(&handle, &mut transfer), Err(Error::NotSupported));

        mock.close(&handle).unwrap();
        assert!(!mock.powered);
    }
}
