//! 16550-style UARTs
//!
//! The LPC17xx has four of them, each gated by one `PCONP` bit. Every port
//! keeps a small software receive buffer, filled from the hardware FIFO by
//! [`Uart::on_interrupt`] and by reads.
//!
//! ```no_run
//! use mcu_periph::{
//!     uart::{self, Config, McuPin, Uart, UartAttr, UartFlags},
//!     Driver, Handle, LastError, Peripherals, Transfer,
//! };
//!
//! struct Lpc1769;
//! unsafe impl Peripherals for Lpc1769 {
//!     fn power(&self) -> *const () {
//!         0x400F_C0C4 as *const ()
//!     }
//!     fn uart(&self, port: u8) -> Option<*const ()> {
//!         [0x4000_C000, 0x4001_0000, 0x4009_8000, 0x4009_C000]
//!             .get(port as usize)
//!             .map(|&addr| addr as *const ())
//!     }
//! }
//!
//! static CONSOLE: Config = Config {
//!     pclk_hz: 25_000_000,
//!     pins: [McuPin::new(0, 2), McuPin::new(0, 3)],
//!     attr: UartAttr {
//!         o_flags: UartFlags::SET_LINE_CODING
//!             .union(UartFlags::IS_STOP1)
//!             .union(UartFlags::IS_PARITY_NONE),
//!         freq: 115_200,
//!         width: 8,
//!     },
//! };
//! static ERRNO: LastError = LastError::new();
//!
//! let mut uart = Uart::new(&Lpc1769).unwrap();
//! let handle = Handle::new(0, &CONSOLE);
//!
//! ERRNO.status(uart.open(&handle));
//! ERRNO.status(uart.ioctl(&handle, uart::request::SET_ATTR, &mut ()));
//! ERRNO.status(uart.write(&handle, &mut Transfer::write(b"hello\r\n")));
//! ```

use crate::{
    driver::{get_version, Driver, Handle, PowerGate},
    ioctl::{self, ctl_mut, Events, IoctlFn, McuAction, I_MCU_TOTAL},
    power::PowerControl,
    ral,
    transfer::{replace_pending, Completion, Transfer},
    Error, Peripherals,
};
use core::any::Any;
use heapless::Deque;

/// Number of UART ports
pub const PORT_COUNT: u8 = 4;
/// Request ident for the UART family
pub const UART_IDENT: u8 = b'u';
pub const UART_VERSION: u32 = ioctl::version(3, 0, 0);

/// Reads one byte from the receive buffer into a `u8` control structure
///
/// Returns 1 if a byte was taken, or 0 if the buffer is empty.
pub const I_UART_GET: u8 = I_MCU_TOTAL as u8;
/// Writes the byte in a `u8` control structure
pub const I_UART_PUT: u8 = I_MCU_TOTAL as u8 + 1;
/// Discards all received data, and resets the hardware FIFOs
pub const I_UART_FLUSH: u8 = I_MCU_TOTAL as u8 + 2;
/// Number of UART-specific requests
pub const I_UART_TOTAL: usize = 3;

/// Request codes for the UART family
pub mod request {
    use super::{UartAttr, UartInfo, UART_IDENT};
    use crate::ioctl::{self, McuAction};
    use core::mem::size_of;

    pub const GET_VERSION: u32 = ioctl::io(UART_IDENT, ioctl::I_MCU_GETVERSION);
    pub const GET_INFO: u32 = ioctl::ior(UART_IDENT, ioctl::I_MCU_GETINFO, size_of::<UartInfo>());
    pub const SET_ATTR: u32 = ioctl::iow(UART_IDENT, ioctl::I_MCU_SETATTR, size_of::<UartAttr>());
    pub const SET_ACTION: u32 =
        ioctl::iow(UART_IDENT, ioctl::I_MCU_SETACTION, size_of::<McuAction>());
    pub const GET: u32 = ioctl::ior(UART_IDENT, super::I_UART_GET, 1);
    pub const PUT: u32 = ioctl::iow(UART_IDENT, super::I_UART_PUT, 1);
    pub const FLUSH: u32 = ioctl::io(UART_IDENT, super::I_UART_FLUSH);
}

/// `PCONP` bits for UART0 through UART3
const POWER_BITS: [u32; PORT_COUNT as usize] = [3, 4, 24, 25];
/// Size of each port's software receive buffer
pub const RX_BUFFER_SIZE: usize = 64;
/// Depth of the hardware receive FIFO
const RX_FIFO_DEPTH: usize = 16;

/// Line status polls before a write gives up on the transmitter
///
/// Enough for one character at 300 baud on a 100 MHz core.
const TX_READY_SPINS: u32 = 1_000_000;

/// Events a UART action may subscribe to
pub const SUPPORTED_EVENTS: Events = Events::DATA_READY
    .union(Events::WRITE_COMPLETE)
    .union(Events::ERROR)
    .union(Events::OVERFLOW);

bitflags::bitflags! {
    /// UART attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UartFlags : u32 {
        /// Apply the baud rate, width, stop bits, and parity
        const SET_LINE_CODING = 1 << 0;
        const IS_STOP1 = 1 << 1;
        const IS_STOP2 = 1 << 2;
        const IS_PARITY_NONE = 1 << 3;
        const IS_PARITY_ODD = 1 << 4;
        const IS_PARITY_EVEN = 1 << 5;
    }
}

/// Control structure for the set-attributes request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartAttr {
    pub o_flags: UartFlags,
    /// Baud rate
    pub freq: u32,
    /// Data bits, 5 through 8
    pub width: u8,
}

/// Control structure for the get-info request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UartInfo {
    /// Supported attribute flags
    pub o_flags: UartFlags,
    /// Supported action events
    pub o_events: Events,
    /// Bytes waiting in the receive buffer
    pub size_ready: usize,
}

/// A pin assignment, consumed by the board's pin mux layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuPin {
    pub port: u8,
    pub pin: u8,
}

impl McuPin {
    pub const fn new(port: u8, pin: u8) -> Self {
        McuPin { port, pin }
    }
}

/// Static configuration for one UART port
#[derive(Debug)]
pub struct Config {
    /// Peripheral clock feeding the baud rate generator
    pub pclk_hz: u32,
    /// RX and TX pins
    pub pins: [McuPin; 2],
    /// Attributes applied by a set-attributes request without a control
    /// structure
    pub attr: UartAttr,
}

#[allow(non_snake_case, non_upper_case_globals, dead_code)]
pub(crate) mod regs {
    use crate::ral::VCell;

    #[repr(C)]
    pub struct RegisterBlock {
        /// Receive buffer (read), transmit holding (write), or divisor
        /// latch LSB when `LCR[DLAB]` is set
        pub RBR: VCell<u32>,
        /// Interrupt enable, or divisor latch MSB when `LCR[DLAB]` is set
        pub IER: VCell<u32>,
        /// Interrupt identification (read), FIFO control (write)
        pub IIR: VCell<u32>,
        pub LCR: VCell<u32>,
        _reserved0: VCell<u32>,
        pub LSR: VCell<u32>,
    }

    #[cfg(test)]
    impl RegisterBlock {
        pub const fn new() -> Self {
            RegisterBlock {
                RBR: VCell::new(0),
                IER: VCell::new(0),
                IIR: VCell::new(1),
                LCR: VCell::new(0),
                _reserved0: VCell::new(0),
                LSR: VCell::new(0x60),
            }
        }
    }

    macro_rules! field {
        ($name:ident, $offset:expr, $mask:expr) => {
            pub mod $name {
                pub const offset: u32 = $offset;
                pub const mask: u32 = $mask << offset;
                pub mod R {}
                pub mod W {}
                pub mod RW {}
            }
        };
    }

    pub mod RBR {}

    pub mod IER {
        field!(RBRIE, 0, 1);
        field!(THREIE, 1, 1);
        field!(RLSIE, 2, 1);
    }

    pub mod IIR {
        field!(INTSTATUS, 0, 1);
        field!(INTID, 1, 0x7);
        // FCR, on write
        field!(FIFOEN, 0, 1);
        field!(RXFIFORES, 1, 1);
        field!(TXFIFORES, 2, 1);
    }

    pub mod LCR {
        // Word length, minus 5
        field!(WLS, 0, 0x3);
        // Two stop bits
        field!(SBS, 2, 1);
        field!(PE, 3, 1);
        // 0 for odd parity, 1 for even
        field!(PS, 4, 0x3);
        field!(DLAB, 7, 1);
    }

    pub mod LSR {
        field!(RDR, 0, 1);
        field!(OE, 1, 1);
        field!(PE, 2, 1);
        field!(FE, 3, 1);
        field!(BI, 4, 1);
        field!(THRE, 5, 1);
        field!(TEMT, 6, 1);
    }
}

type Instance = ral::Instance<regs::RegisterBlock>;

struct PortState {
    rx: Deque<u8, RX_BUFFER_SIZE>,
    action: Option<McuAction>,
    pending_read: Option<&'static Completion>,
    attr: Option<UartAttr>,
}

impl PortState {
    const NEW: PortState = PortState {
        rx: Deque::new(),
        action: None,
        pending_read: None,
        attr: None,
    };
}

/// The UART family
pub struct Uart {
    power: PowerControl,
    ports: [Option<Instance>; PORT_COUNT as usize],
    state: [PortState; PORT_COUNT as usize],
}

impl Uart {
    /// Take the power register and the UART register blocks
    ///
    /// Returns `None` if the power register is missing. Ports without a
    /// register block can be opened and closed, but not used.
    pub fn new<P: Peripherals>(peripherals: &P) -> Option<Self> {
        // Safety: the Peripherals implementation vouches for these addresses.
        let power = unsafe { PowerControl::new(peripherals.power()) }?;
        let ports = core::array::from_fn(|port| {
            peripherals
                .uart(port as u8)
                .and_then(|addr| unsafe { ral::Instance::new(addr) })
        });
        Some(Uart {
            power,
            ports,
            state: [PortState::NEW; PORT_COUNT as usize],
        })
    }

    /// Service the UART interrupt for `port`
    ///
    /// Drains the hardware FIFO into the receive buffer, completes a pending
    /// read, and signals the port's action. Returns the events that fired.
    /// Call this from the UART's interrupt handler.
    pub fn on_interrupt(&mut self, port: u8) -> Events {
        let index = port as usize;
        if port >= PORT_COUNT || !self.power.is_enabled(POWER_BITS[index]) {
            return Events::empty();
        }
        let Some(regs) = self.ports[index].as_ref() else {
            return Events::empty();
        };
        let _ = ral::read_reg!(crate::uart::regs, regs, IIR);
        service(regs, &mut self.state[index])
    }

    /// The attributes last applied to `port`
    pub fn attributes(&self, port: u8) -> Option<UartAttr> {
        self.state.get(port as usize).and_then(|state| state.attr)
    }

    fn port(&self, handle: &Handle<Config>) -> Result<&Instance, Error> {
        self.ports[handle.port() as usize]
            .as_ref()
            .ok_or(Error::NotSupported)
    }

    fn set_attributes(&mut self, handle: &Handle<Config>, attr: &UartAttr) -> Result<(), Error> {
        if !attr.o_flags.contains(UartFlags::SET_LINE_CODING) {
            return Ok(());
        }
        let line = LineCoding::new(handle.config().pclk_hz, attr)?;
        let regs = self.port(handle)?;

        ral::modify_reg!(crate::uart::regs, regs, LCR, DLAB: 1);
        ral::write_reg!(crate::uart::regs, regs, RBR, line.divisor & 0xFF);
        ral::write_reg!(crate::uart::regs, regs, IER, line.divisor >> 8);
        ral::write_reg!(
            crate::uart::regs,
            regs,
            LCR,
            WLS: line.width - 5,
            SBS: line.two_stop_bits as u32,
            PE: line.parity.is_some() as u32,
            PS: line.parity.unwrap_or(0)
        );
        ral::write_reg!(crate::uart::regs, regs, IIR, FIFOEN: 1, RXFIFORES: 1, TXFIFORES: 1);
        ral::write_reg!(crate::uart::regs, regs, IER, RBRIE: 1);

        debug!("UART{} {} BAUD DIVISOR {}", handle.port(), attr.freq, line.divisor);
        self.state[handle.port() as usize].attr = Some(*attr);
        Ok(())
    }

    /// Wait a bounded time for the holding register, then send `byte`
    ///
    /// A transmitter that stays busy for [`TX_READY_SPINS`] polls is
    /// `NotSupported`, and the byte isn't sent.
    fn transmit(&self, handle: &Handle<Config>, byte: u8) -> Result<(), Error> {
        let regs = self.port(handle)?;
        let ready = (0..TX_READY_SPINS)
            .any(|_| ral::read_reg!(crate::uart::regs, regs, LSR, THRE == 1));
        if !ready {
            warn!("UART{} TX STUCK", handle.port());
            return Err(Error::NotSupported);
        }
        ral::write_reg!(crate::uart::regs, regs, RBR, byte as u32);
        Ok(())
    }
}

/// Register values for one line coding
struct LineCoding {
    divisor: u32,
    width: u32,
    two_stop_bits: bool,
    /// The `LCR[PS]` value, if parity is enabled
    parity: Option<u32>,
}

impl LineCoding {
    /// Validate `attr` against a peripheral clock of `pclk_hz`
    fn new(pclk_hz: u32, attr: &UartAttr) -> Result<Self, Error> {
        let flags = attr.o_flags;
        if !(5..=8).contains(&attr.width) {
            return Err(Error::InvalidArgument);
        }
        if flags.contains(UartFlags::IS_STOP1 | UartFlags::IS_STOP2) {
            return Err(Error::InvalidArgument);
        }
        let parities = flags
            & (UartFlags::IS_PARITY_NONE | UartFlags::IS_PARITY_ODD | UartFlags::IS_PARITY_EVEN);
        if parities.bits().count_ones() > 1 {
            return Err(Error::InvalidArgument);
        }
        if attr.freq == 0 {
            return Err(Error::InvalidArgument);
        }

        let oversampled = 16 * attr.freq as u64;
        let divisor = (pclk_hz as u64 + oversampled / 2) / oversampled;
        if !(1..=0xFFFF).contains(&divisor) {
            return Err(Error::InvalidArgument);
        }

        let parity = if parities == UartFlags::IS_PARITY_ODD {
            Some(0)
        } else if parities == UartFlags::IS_PARITY_EVEN {
            Some(1)
        } else {
            None
        };

        Ok(LineCoding {
            divisor: divisor as u32,
            width: attr.width as u32,
            two_stop_bits: flags.contains(UartFlags::IS_STOP2),
            parity,
        })
    }
}

/// Move bytes from the hardware FIFO into `rx`
fn drain(regs: &Instance, rx: &mut Deque<u8, RX_BUFFER_SIZE>) -> Events {
    let mut fired = Events::empty();
    for _ in 0..RX_FIFO_DEPTH {
        let lsr = ral::read_reg!(crate::uart::regs, regs, LSR);
        if (lsr & regs::LSR::OE::mask) != 0 {
            fired |= Events::OVERFLOW;
        }
        if (lsr & (regs::LSR::PE::mask | regs::LSR::FE::mask | regs::LSR::BI::mask)) != 0 {
            fired |= Events::ERROR;
        }
        if (lsr & regs::LSR::RDR::mask) == 0 {
            break;
        }
        let byte = ral::read_reg!(crate::uart::regs, regs, RBR) as u8;
        if rx.push_back(byte).is_err() {
            fired |= Events::OVERFLOW;
        } else {
            fired |= Events::DATA_READY;
        }
    }
    fired
}

/// Drain the port, complete a pending read, and signal the action
fn service(regs: &Instance, state: &mut PortState) -> Events {
    let fired = drain(regs, &mut state.rx);
    if fired.intersects(Events::ERROR | Events::OVERFLOW) {
        warn!("UART LINE STATUS {:?}", fired);
    }
    if fired.contains(Events::DATA_READY) {
        if let Some(completion) = state.pending_read.take() {
            completion.complete(Events::DATA_READY, Ok(state.rx.len()));
        }
    }
    if let Some(action) = &state.action {
        action.signal(fired, Ok(state.rx.len()));
    }
    fired
}

impl PowerGate for Uart {
    type Config = Config;
    const PORT_COUNT: u8 = PORT_COUNT;

    fn is_powered(&self, handle: &Handle<Config>) -> bool {
        self.power.is_enabled(POWER_BITS[handle.port() as usize])
    }

    fn power_on(&mut self, handle: &Handle<Config>) {
        self.power.enable(POWER_BITS[handle.port() as usize]);
        debug!("UART{} ON", handle.port());
    }

    fn power_off(&mut self, handle: &Handle<Config>) {
        let index = handle.port() as usize;
        if let Some(regs) = self.ports[index].as_ref() {
            ral::write_reg!(crate::uart::regs, regs, IER, 0);
        }
        let state = &mut self.state[index];
        state.rx.clear();
        state.attr = None;
        if let Some(completion) = state.pending_read.take() {
            completion.complete(Events::CANCELED, Ok(0));
        }
        self.power.disable(POWER_BITS[index]);
        debug!("UART{} OFF", handle.port());
    }
}

fn get_info(uart: &mut Uart, handle: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
    let info = ctl_mut::<UartInfo>(ctl)?;
    let regs = uart.ports[handle.port() as usize]
        .as_ref()
        .ok_or(Error::NotSupported)?;
    let state = &mut uart.state[handle.port() as usize];
    drain(regs, &mut state.rx);
    *info = UartInfo {
        o_flags: UartFlags::all(),
        o_events: SUPPORTED_EVENTS,
        size_ready: state.rx.len(),
    };
    Ok(0)
}

fn set_attr(uart: &mut Uart, handle: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
    let attr = if ctl.is::<()>() {
        handle.config().attr
    } else {
        *ctl_mut::<UartAttr>(ctl)?
    };
    uart.set_attributes(handle, &attr)?;
    Ok(0)
}

fn set_action(uart: &mut Uart, handle: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
    let action = *ctl_mut::<McuAction>(ctl)?;
    if !SUPPORTED_EVENTS.contains(action.events) {
        return Err(Error::InvalidArgument);
    }
    let state = &mut uart.state[handle.port() as usize];
    state.action = match (action.events.is_empty(), action.completion) {
        (true, _) => None,
        (false, Some(_)) => Some(action),
        (false, None) => return Err(Error::InvalidArgument),
    };
    Ok(0)
}

fn get_byte(uart: &mut Uart, handle: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
    let byte = ctl_mut::<u8>(ctl)?;
    let regs = uart.ports[handle.port() as usize]
        .as_ref()
        .ok_or(Error::NotSupported)?;
    let state = &mut uart.state[handle.port() as usize];
    drain(regs, &mut state.rx);
    match state.rx.pop_front() {
        Some(received) => {
            *byte = received;
            Ok(1)
        }
        None => Ok(0),
    }
}

fn put_byte(uart: &mut Uart, handle: &Handle<Config>, ctl: &mut dyn Any) -> Result<i32, Error> {
    let byte = *ctl_mut::<u8>(ctl)?;
    uart.transmit(handle, byte)?;
    Ok(0)
}

fn flush(uart: &mut Uart, handle: &Handle<Config>, _: &mut dyn Any) -> Result<i32, Error> {
    let regs = uart.port(handle)?;
    ral::write_reg!(crate::uart::regs, regs, IIR, FIFOEN: 1, RXFIFORES: 1, TXFIFORES: 1);
    uart.state[handle.port() as usize].rx.clear();
    Ok(0)
}

impl Driver for Uart {
    const IDENT: u8 = UART_IDENT;
    const VERSION: u32 = UART_VERSION;
    const IOCTL: &'static [IoctlFn<Self>] = &{
        let table: [IoctlFn<Self>; I_MCU_TOTAL + I_UART_TOTAL] = [
            get_version::<Self>,
            get_info,
            set_attr,
            set_action,
            get_byte,
            put_byte,
            flush,
        ];
        table
    };

    /// Read buffered bytes
    ///
    /// Returns 0 when nothing has arrived. If the transfer has a completion,
    /// it's armed, and [`on_interrupt`](Uart::on_interrupt) completes it
    /// with the number of buffered bytes. Re-issue the read to collect them.
    fn device_read(
        &mut self,
        handle: &Handle<Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        let index = handle.port() as usize;
        let regs = self.ports[index].as_ref().ok_or(Error::NotSupported)?;
        let state = &mut self.state[index];
        service(regs, state);

        let destination = transfer.destination()?;
        let requested = destination.len();
        let mut count = 0;
        for slot in destination.iter_mut() {
            match state.rx.pop_front() {
                Some(byte) => *slot = byte,
                None => break,
            }
            count += 1;
        }

        if count == 0 && requested != 0 {
            if let Some(completion) = transfer.completion() {
                completion.arm();
                replace_pending(&mut state.pending_read, completion);
            }
        }
        Ok(count)
    }

    /// Write every byte, waiting for room in the transmitter
    ///
    /// Signals `WRITE_COMPLETE` to the port's action before returning. A
    /// transmitter that stops draining fails the write part way through.
    fn device_write(
        &mut self,
        handle: &Handle<Config>,
        transfer: &mut Transfer<'_>,
    ) -> Result<usize, Error> {
        let source = transfer.source()?;
        for &byte in source {
            self.transmit(handle, byte)?;
        }
        if let Some(action) = &self.state[handle.port() as usize].action {
            action.signal(Events::WRITE_COMPLETE, Ok(source.len()));
        }
        Ok(source.len())
    }
}
