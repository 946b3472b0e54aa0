//! Ioctl request codes and dispatch tables
//!
//! # Request codes
//!
//! A request code packs a peripheral family's single-character ident and
//! a small request number, so every family gets its own namespace:
//!
//! | Bits  | Meaning                                    |
//! |-------|--------------------------------------------|
//! | 0-7   | request number (index into the dispatch table) |
//! | 8-15  | family ident, like `b'u'` for the UART     |
//! | 16-29 | size of the control structure              |
//! | 30    | the driver writes the control structure    |
//! | 31    | the driver reads the control structure     |
//!
//! The generic requests occupy the low numbers in every family; family
//! requests start at [`I_MCU_TOTAL`].
//!
//! # Dispatch tables
//!
//! Each family declares an ordered array of [`IoctlFn`] handlers, one per
//! request number. Index 0 is always [`get_version`](crate::driver::get_version).
//! Families spell out the array type with its length,
//! `[IoctlFn<Self>; I_MCU_TOTAL + I_<FAMILY>_TOTAL]`, so a missing or
//! extra handler fails to compile.

use crate::{
    driver::{Handle, PowerGate},
    transfer::Completion,
    Error,
};
use core::any::Any;

/// Returns the driver version. The control structure is ignored.
pub const I_MCU_GETVERSION: u8 = 0;
/// Copies the family's info structure into the control structure.
pub const I_MCU_GETINFO: u8 = 1;
/// Applies the family's attribute structure.
pub const I_MCU_SETATTR: u8 = 2;
/// Subscribes an [`McuAction`] to peripheral events.
pub const I_MCU_SETACTION: u8 = 3;
/// Number of generic requests
pub const I_MCU_TOTAL: usize = 4;

const NUMBER_MASK: u32 = 0xFF;
const IDENT_OFFSET: u32 = 8;
const IDENT_MASK: u32 = 0xFF << IDENT_OFFSET;
const SIZE_OFFSET: u32 = 16;
const SIZE_MASK: u32 = 0x3FFF << SIZE_OFFSET;

bitflags::bitflags! {
    /// Which way the control structure travels
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Direction : u32 {
        /// The driver writes the control structure (`_IOCTLR`)
        const OUT = 1 << 30;
        /// The driver reads the control structure (`_IOCTLW`)
        const IN = 1 << 31;
    }
}

/// A request without a control structure
pub const fn io(ident: u8, number: u8) -> u32 {
    ((ident as u32) << IDENT_OFFSET) | number as u32
}

/// A request that fills a control structure of `size` bytes
pub const fn ior(ident: u8, number: u8, size: usize) -> u32 {
    io(ident, number) | encode_size(size) | Direction::OUT.bits()
}

/// A request that reads a control structure of `size` bytes
pub const fn iow(ident: u8, number: u8, size: usize) -> u32 {
    io(ident, number) | encode_size(size) | Direction::IN.bits()
}

/// A request that reads and updates a control structure of `size` bytes
pub const fn iowr(ident: u8, number: u8, size: usize) -> u32 {
    io(ident, number) | encode_size(size) | Direction::IN.bits() | Direction::OUT.bits()
}

const fn encode_size(size: usize) -> u32 {
    ((size as u32) << SIZE_OFFSET) & SIZE_MASK
}

/// The request number, which indexes the dispatch table
pub const fn number(request: u32) -> u8 {
    (request & NUMBER_MASK) as u8
}

/// The family ident; 0 for a bare request number
pub const fn ident(request: u32) -> u8 {
    ((request & IDENT_MASK) >> IDENT_OFFSET) as u8
}

/// The size of the control structure
pub const fn size(request: u32) -> usize {
    ((request & SIZE_MASK) >> SIZE_OFFSET) as usize
}

pub const fn direction(request: u32) -> Direction {
    Direction::from_bits_truncate(request)
}

/// Pack a driver version as `0x00MMmmpp`
pub const fn version(major: u8, minor: u8, patch: u8) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8) | patch as u32
}

/// An ioctl request handler
///
/// Handlers receive the driver, the handle, and the opaque control
/// structure. They downcast the control structure to the type they expect,
/// and return [`Error::InvalidArgument`] when it doesn't match. The result
/// goes back to the caller verbatim.
pub type IoctlFn<P> =
    fn(&mut P, &Handle<<P as PowerGate>::Config>, &mut dyn Any) -> Result<i32, Error>;

/// A family's dispatch table
pub struct IoctlTable<'t, P: PowerGate> {
    ident: u8,
    handlers: &'t [IoctlFn<P>],
}

impl<'t, P: PowerGate> IoctlTable<'t, P> {
    pub const fn new(ident: u8, handlers: &'t [IoctlFn<P>]) -> Self {
        IoctlTable { ident, handlers }
    }

    /// The family ident accepted by this table
    pub const fn ident(&self) -> u8 {
        self.ident
    }

    /// Number of requests in this table
    pub const fn len(&self) -> usize {
        self.handlers.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Find the handler for `request`
    ///
    /// Fails if the request belongs to another family, or if its number
    /// is past the end of the table.
    pub fn resolve(&self, request: u32) -> Result<IoctlFn<P>, Error> {
        let ident = ident(request);
        if ident != 0 && ident != self.ident {
            return Err(Error::InvalidArgument);
        }
        self.handlers
            .get(number(request) as usize)
            .copied()
            .ok_or(Error::InvalidArgument)
    }
}

bitflags::bitflags! {
    /// Peripheral events, reported through [`Completion`]s
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events : u32 {
        /// Data is ready to read
        const DATA_READY = 1 << 0;
        /// A write finished
        const WRITE_COMPLETE = 1 << 1;
        /// A pending operation was abandoned
        const CANCELED = 1 << 2;
        /// The hardware reported an error
        const ERROR = 1 << 3;
        /// A USB setup packet arrived
        const SETUP = 1 << 4;
        /// A bus reset happened
        const RESET = 1 << 5;
        const SUSPEND = 1 << 6;
        const RESUME = 1 << 7;
        /// Received data was dropped
        const OVERFLOW = 1 << 8;
    }
}

/// Control structure for [`I_MCU_SETACTION`]
///
/// Subscribes `completion` to `events` on `channel`. The meaning of
/// `channel` is family-specific (the USB family uses the endpoint address;
/// the UART ignores it). Empty `events` remove the subscription.
#[derive(Clone, Copy)]
pub struct McuAction {
    pub channel: u32,
    pub events: Events,
    pub completion: Option<&'static Completion>,
}

impl McuAction {
    /// An action that clears any subscription
    pub const fn none() -> Self {
        McuAction {
            channel: 0,
            events: Events::empty(),
            completion: None,
        }
    }

    /// Complete the subscribed slot with the `fired` events it asked for
    ///
    /// Does nothing when none of the fired events are subscribed.
    pub fn signal(&self, fired: Events, result: Result<usize, Error>) {
        let events = fired & self.events;
        if let (false, Some(completion)) = (events.is_empty(), self.completion) {
            completion.complete(events, result);
        }
    }
}

/// Downcast a control structure, or fail with `InvalidArgument`
pub(crate) fn ctl_mut<T: Any>(ctl: &mut dyn Any) -> Result<&mut T, Error> {
    ctl.downcast_mut::<T>().ok_or(Error::InvalidArgument)
}
