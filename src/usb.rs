//! USB device peripheral
//!
//! `Usb` puts the `open / ioctl / read / write / close` interface on top of
//! any [`UsbBus`] implementation. The bus implementation owns the hardware
//! details. `Usb` adds power gating, endpoint selection through the
//! transfer location, and completions for transfers that would block.
//!
//! A transfer's location is the endpoint number. Reads use the OUT
//! endpoint, and writes use the IN endpoint. When the bus would block,
//! the transfer's completion is armed and the call returns 0. Call
//! [`Usb::poll`] from the USB interrupt handler to complete it, then
//! re-issue the transfer.

use crate::{
    driver::{get_version, Driver, Handle, PowerGate},
    ioctl::{self, ctl_mut, Events, IoctlFn, McuAction, I_MCU_TOTAL},
    power::PowerControl,
    transfer::{replace_pending, Completion, Transfer},
    Error, Peripherals,
};
use core::any::Any;
use usb_device::{
    bus::{PollResult, UsbBus},
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// Request ident for the USB family
pub const USB_IDENT: u8 = b'U';
pub const USB_VERSION: u32 = ioctl::version(3, 0, 0);

/// Reports if the endpoint address in a `u8` control structure is stalled
pub const I_USB_ISSTALLED: u8 = I_MCU_TOTAL as u8;
/// Ask the bus to force a bus reset
pub const I_USB_FORCERESET: u8 = I_MCU_TOTAL as u8 + 1;
/// Number of USB-specific requests
pub const I_USB_TOTAL: usize = 2;

/// Request codes for the USB family
pub mod request {
    use super::{UsbAttr, UsbInfo, USB_IDENT};
    use crate::ioctl::{self, McuAction};
    use core::mem::size_of;

    pub const GET_VERSION: u32 = ioctl::io(USB_IDENT, ioctl::I_MCU_GETVERSION);
    pub const GET_INFO: u32 = ioctl::ior(USB_IDENT, ioctl::I_MCU_GETINFO, size_of::<UsbInfo>());
    pub const SET_ATTR: u32 = ioctl::iow(USB_IDENT, ioctl::I_MCU_SETATTR, size_of::<UsbAttr>());
    pub const SET_ACTION: u32 = ioctl::iow(USB_IDENT, ioctl::I_MCU_SETACTION, size_of::<McuAction>());
    pub const IS_STALLED: u32 = ioctl::iowr(USB_IDENT, super::I_USB_ISSTALLED, 1);
    pub const FORCE_RESET: u32 = ioctl::io(USB_IDENT, super::I_USB_FORCERESET);
}

/// `PCONP` bit for the USB controller
const POWER_BIT: u32 = 31;
/// Endpoint numbers per direction
pub const ENDPOINT_COUNT: usize = 16;

/// Events a USB action may subscribe to
pub const SUPPORTED_EVENTS: Events = Events::DATA_READY
    .union(Events::WRITE_COMPLETE)
    .union(Events::CANCELED)
    .union(Events::SETUP)
    .union(Events::RESET)
    .union(Events::SUSPEND)
    .union(Events::RESUME);

bitflags::bitflags! {
    /// USB attribute flags, applied in declaration order
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsbFlags : u32 {
        /// Enable the bus, and attach to the host
        const ATTACH = 1 << 0;
        const RESET = 1 << 1;
        const SET_ADDRESS = 1 << 2;
        /// Allocate and enable `endpoint`
        const CONFIGURE_ENDPOINT = 1 << 3;
        const STALL_ENDPOINT = 1 << 4;
        const UNSTALL_ENDPOINT = 1 << 5;
    }
}

/// Control structure for the set-attributes request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbAttr {
    pub o_flags: UsbFlags,
    /// Device address, for `SET_ADDRESS`
    pub address: u8,
    /// Endpoint address (bit 7 set for IN)
    pub endpoint: u8,
    pub max_packet_size: u16,
    pub ep_type: EndpointType,
}

/// Control structure for the get-info request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbInfo {
    pub o_flags: UsbFlags,
    pub o_events: Events,
}

/// Static configuration for the USB port
#[derive(Debug)]
pub struct Config {
    /// Attributes applied by a set-attributes request without a control
    /// structure
    pub attr: UsbAttr,
}

/// One slot per endpoint address
const SLOTS: usize = ENDPOINT_COUNT * 2;

fn slot(address: EndpointAddress) -> usize {
    address.index() * 2 + address.is_in() as usize
}

fn endpoint_address(address: u8) -> Result<EndpointAddress, Error> {
    let address = EndpointAddress::from(address);
    if address.index() < ENDPOINT_COUNT {
        Ok(address)
    } else {
        Err(Error::InvalidArgument)
    }
}

/// The endpoint selected by a transfer location
fn transfer_endpoint(loc: i32, direction: UsbDirection) -> Result<EndpointAddress, Error> {
    usize::try_from(loc)
        .ok()
        .filter(|&index| index < ENDPOINT_COUNT)
        .map(|index| EndpointAddress::from_parts(index, direction))
        .ok_or(Error::InvalidArgument)
}

fn map_error(error: UsbError) -> Error {
    match error {
        UsbError::Unsupported => Error::NotSupported,
        _ => Error::InvalidArgument,
    }
}

/// The USB device family
pub struct Usb<B> {
    power: PowerControl,
    bus: B,
    pending: [Option<&'static Completion>; SLOTS],
    actions: [Option<McuAction>; SLOTS],
}

impl<B: UsbBus> Usb<B> {
    /// Take the power register, and the USB bus
    ///
    /// Returns `None` if the power register is missing.
    pub fn new<P: Peripherals>(peripherals: &P, bus: B) -> Option<Self> {
        // Safety: the Peripherals implementation vouches for the address.
        let power = unsafe { PowerControl::new(peripherals.power()) }?;
        Some(Usb {
            power,
            bus,
            pending: [None; SLOTS],
            actions: [None; SLOTS],
        })
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Service the USB bus
    ///
    /// Completes pending transfers on endpoints with new activity, and
    /// signals the actions subscribed to the events. Returns the events that
    /// fired. Call this from the USB interrupt handler.
    pub fn poll(&mut self) -> Events {
        if !self.power.is_enabled(POWER_BIT) {
            return Events::empty();
        }
        match self.bus.poll() {
            PollResult::None => Events::empty(),
            PollResult::Reset => {
                debug!("USB RESET");
                self.cancel_pending();
                self.signal_bus(Events::RESET)
            }
            PollResult::Suspend => self.signal_bus(Events::SUSPEND),
            PollResult::Resume => self.signal_bus(Events::RESUME),
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            } => {
                let mut fired = Events::empty();
                for index in 0..ENDPOINT_COUNT {
                    let bit = 1u16 << index;
                    if ((ep_out | ep_setup) & bit) != 0 {
                        let events = if (ep_setup & bit) != 0 {
                            Events::SETUP | Events::DATA_READY
                        } else {
                            Events::DATA_READY
                        };
                        self.endpoint_event(
                            EndpointAddress::from_parts(index, UsbDirection::Out),
                            events,
                        );
                        fired |= events;
                    }
                    if (ep_in_complete & bit) != 0 {
                        self.endpoint_event(
                            EndpointAddress::from_parts(index, UsbDirection::In),
                            Events::WRITE_COMPLETE,
                        );
                        fired |= Events::WRITE_COMPLETE;
                    }
                }
                fired
            }
        }
    }

    fn endpoint_event(&mut self, address: EndpointAddress, events: Events) {
        let slot = slot(address);
        if let Some(completion) = self.pending[slot].take() {
            completion.complete(events, Ok(0));
        }
        if let Some(action) = &self.actions[slot] {
            action.signal(events, Ok(0));
        }
    }

    /// Bus events go to every action that subscribed to them
    fn signal_bus(&self, events: Events) -> Events {
        for action in self.actions.iter().flatten() {
            action.signal(events, Ok(0));
        }
        events
    }

    fn cancel_pending(&mut self) {
        for completion in self.pending.iter_mut().filter_map(Option::take) {
            completion.complete(Events::CANCELED, Ok(0));
        }
    }

    fn set_attributes(&mut self, attr: &UsbAttr) -> Result<(), Error> {
        let flags = attr.o_flags;
        if flags.contains(UsbFlags::STALL_ENDPOINT | UsbFlags::UNSTALL_ENDPOINT) {
            return Err(Error::InvalidArgument);
        }
        if flags.contains(UsbFlags::SET_ADDRESS) && attr.address > 127 {
            return Err(Error::InvalidArgument);
        }
        let endpoint = if flags.intersects(
            UsbFlags::CONFIGURE_ENDPOINT | UsbFlags::STALL_ENDPOINT | UsbFlags::UNSTALL_ENDPOINT,
        ) {
            Some(endpoint_address(attr.endpoint)?)
        } else {
            None
        };
        if flags.contains(UsbFlags::CONFIGURE_ENDPOINT) && attr.max_packet_size == 0 {
            return Err(Error::InvalidArgument);
        }

        if flags.contains(UsbFlags::ATTACH) {
            self.bus.enable();
            debug!("USB ATTACH");
        }
        if flags.contains(UsbFlags::RESET) {
            self.bus.reset();
            self.cancel_pending();
        }
        if flags.contains(UsbFlags::SET_ADDRESS) {
            self.bus.set_device_address(attr.address);
            debug!("USB ADDRESS {}", attr.address);
        }
        if let Some(endpoint) = endpoint {
            if flags.contains(UsbFlags::CONFIGURE_ENDPOINT) {
                self.bus
                    .alloc_ep(
                        endpoint.direction(),
                        Some(endpoint),
                        attr.ep_type,
                        attr.max_packet_size,
                        1,
                    )
                    .map_err(|error| {
                        warn!("USB ALLOC EP{} {:?}", endpoint.index(), error);
                        map_error(error)
                    })?;
            }
            if flags.contains(UsbFlags::STALL_ENDPOINT) {
                self.bus.set_stalled(endpoint, true);
            }
            if flags.contains(UsbFlags::UNSTALL_ENDPOINT) {
                self.bus.set_stalled(endpoint, false);
            }
        }
        Ok(())
    }

    /// Keep the transfer's completion if the bus would block
    fn finish(
        &mut self,
        address: EndpointAddress,
        transfer: &Transfer<'_>,
        result: usb_device::Result<usize>,
    ) -> Result<usize, Error> {
        match result {
            Ok(count) => Ok(count),
            Err(UsbError::WouldBlock) => {
                if let Some(completion) = transfer.completion() {
                    completion.arm();
                    replace_pending(&mut self.pending[slot(address)], completion);
                }
                Ok(0)
            }
            Err(error) => {
                warn!("USB EP{} {:?}", address.index(), error);
                Err(map_error(error))
            }
        }
    }
}

impl<B: UsbBus> PowerGate for Usb<B> {
    type Config = Config;
    const PORT_COUNT: u8 = 1;

    fn is_powered(&self, _: &Handle<Config>) -> bool {
        self.power.is_enabled(POWER_BIT)
    }

    fn power_on(&mut self, _: &Handle<Config>) {
        self.power.enable(POWER_BIT);
        debug!("USB ON");
    }

    fn power_off(&mut self, _: &Handle<Config>) {
        self.cancel_pending();
        self.power.disable(POWER_BIT);
        debug!("USB OFF");
    }
}

fn get_info<B: UsbBus>(_: &mut Usb<B>, _: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
    *ctl_mut::<UsbInfo>(ctl)? = UsbInfo {
        o_flags: UsbFlags::all(),
        o_events: SUPPORTED_EVENTS,
    };
    Ok(0)
}

fn set_attr<B: UsbBus>(
    usb: &mut Usb<B>,
    handle: &Handle<Config>,
    ctl: &mut dyn Any,
) -> Result<i32, Error> {
    let attr = if ctl.is::<()>() {
        handle.config().attr
    } else {
        *ctl_mut::<UsbAttr>(ctl)?
    };
    usb.set_attributes(&attr)?;
    Ok(0)
}

fn set_action<B: UsbBus>(
    usb: &mut Usb<B>,
    _: &Handle<Config>,
    ctl: &mut dyn Any,
) -> Result<i32, Error> {
    let action = *ctl_mut::<McuAction>(ctl)?;
    let channel = u8::try_from(action.channel).map_err(|_| Error::InvalidArgument)?;
    let slot = slot(endpoint_address(channel)?);
    if !SUPPORTED_EVENTS.contains(action.events) {
        return Err(Error::InvalidArgument);
    }
    usb.actions[slot] = match (action.events.is_empty(), action.completion) {
        (true, _) => None,
        (false, Some(_)) => Some(action),
        (false, None) => return Err(Error::InvalidArgument),
    };
    Ok(0)
}

fn is_stalled<B: UsbBus>(
    usb: &mut Usb<B>,
    _: &Handle<Config>,
    ctl: &mut dyn Any,
) -> Result<i32, Error> {
    let endpoint = endpoint_address(*ctl_mut::<u8>(ctl)?)?;
    Ok(usb.bus.is_stalled(endpoint) as i32)
}

fn force_reset<B: UsbBus>(usb: &mut Usb<B>, _: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
    usb.bus.force_reset().map_err(map_error)?;
    Ok(0)
}

impl<B: UsbBus + 'static> Driver for Usb<B> {
    const IDENT: u8 = USB_IDENT;
    const VERSION: u32 = USB_VERSION;
    const IOCTL: &'static [IoctlFn<Self>] = &{
        let table: [IoctlFn<Self>; I_MCU_TOTAL + I_USB_TOTAL] = [
            get_version::<Self>,
            get_info::<B>,
            set_attr::<B>,
            set_action::<B>,
            is_stalled::<B>,
            force_reset::<B>,
        ];
        table
    };

    fn device_read(
        &mut self,
        _: &Handle<Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        let address = transfer_endpoint(transfer.loc(), UsbDirection::Out)?;
        let result = self.bus.read(address, transfer.destination()?);
        self.finish(address, transfer, result)
    }

    fn device_write(
        &mut self,
        _: &Handle<Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        let address = transfer_endpoint(transfer.loc(), UsbDirection::In)?;
        let result = self.bus.write(address, transfer.source()?);
        self.finish(address, transfer, result)
    }
}
