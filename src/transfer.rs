//! Transfer descriptors and completions
//!
//! A [`Transfer`] describes one read or write: the buffer, how many bytes
//! to move, and which location or endpoint to use on multiplexed hardware.
//! It's borrowed for the duration of the call.
//!
//! When a driver can't finish a transfer right away, it arms the
//! transfer's [`Completion`] and returns 0. Later, usually from an interrupt
//! handler, the driver completes it. The owner polls the completion from
//! task context, and re-issues the transfer to collect the data. Each
//! driver documents where its completions are delivered.
//!
//! ```
//! use mcu_periph::transfer::{Completion, Transfer};
//!
//! static RX_DONE: Completion = Completion::new();
//!
//! let mut buffer = [0u8; 16];
//! let transfer = Transfer::read(&mut buffer)
//!     .at(1)
//!     .with_completion(&RX_DONE);
//! assert_eq!(transfer.nbyte(), 16);
//! assert_eq!(transfer.loc(), 1);
//! ```

use crate::{ioctl::Events, Error};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, AtomicU32, Ordering};

enum Buffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Buffer<'_> {
    fn len(&self) -> usize {
        match self {
            Buffer::Read(buffer) => buffer.len(),
            Buffer::Write(buffer) => buffer.len(),
        }
    }
}

/// Describes one read or write
pub struct Transfer<'a> {
    loc: i32,
    nbyte: usize,
    buffer: Buffer<'a>,
    completion: Option<&'static Completion>,
}

impl<'a> Transfer<'a> {
    /// A transfer that reads into `buffer`
    pub fn read(buffer: &'a mut [u8]) -> Self {
        Transfer {
            loc: 0,
            nbyte: buffer.len(),
            buffer: Buffer::Read(buffer),
            completion: None,
        }
    }

    /// A transfer that writes from `buffer`
    pub fn write(buffer: &'a [u8]) -> Self {
        Transfer {
            loc: 0,
            nbyte: buffer.len(),
            buffer: Buffer::Write(buffer),
            completion: None,
        }
    }

    /// Select a location (a USB endpoint number, a memory offset, ...)
    pub fn at(mut self, loc: i32) -> Self {
        self.loc = loc;
        self
    }

    /// Attach a completion, signaled if the transfer can't finish now
    pub fn with_completion(mut self, completion: &'static Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Limit the transfer to `nbyte` bytes
    ///
    /// Fails if `nbyte` is larger than the buffer.
    pub fn with_nbyte(mut self, nbyte: usize) -> Result<Self, Error> {
        if nbyte > self.buffer.len() {
            return Err(Error::InvalidArgument);
        }
        self.nbyte = nbyte;
        Ok(self)
    }

    pub fn loc(&self) -> i32 {
        self.loc
    }

    /// The number of bytes requested
    pub fn nbyte(&self) -> usize {
        self.nbyte
    }

    pub fn completion(&self) -> Option<&'static Completion> {
        self.completion
    }

    pub fn is_read(&self) -> bool {
        matches!(self.buffer, Buffer::Read(_))
    }

    /// The destination of a read, limited to `nbyte`
    ///
    /// Fails if this is a write transfer.
    pub fn destination(&mut self) -> Result<&mut [u8], Error> {
        match &mut self.buffer {
            Buffer::Read(buffer) => Ok(&mut buffer[..self.nbyte]),
            Buffer::Write(_) => Err(Error::InvalidArgument),
        }
    }

    /// The source of a write, limited to `nbyte`
    ///
    /// Fails if this is a read transfer.
    pub fn source(&self) -> Result<&[u8], Error> {
        match &self.buffer {
            Buffer::Write(buffer) => Ok(&buffer[..self.nbyte]),
            Buffer::Read(_) => Err(Error::InvalidArgument),
        }
    }
}

/// What a driver reported when it completed a [`Completion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// The events that fired
    pub events: Events,
    /// Bytes available or transferred, or the failure
    pub result: Result<usize, Error>,
}

/// A one-shot completion slot
///
/// Allocate it in a `static`, and hand it to transfers or actions.
/// Only atomic loads and stores are used, so it's safe to complete from an
/// interrupt handler on any Cortex-M core.
///
/// The driver that completes the slot owns `sequence`; the task that takes
/// outcomes owns `taken`. `sequence` is odd while an outcome is being
/// written, and a reader retries if it moved underneath it. A completion
/// that lands while the owner takes an older one is never lost: it
/// advances `sequence` past `taken`.
pub struct Completion {
    pending: AtomicBool,
    sequence: AtomicU32,
    taken: AtomicU32,
    events: AtomicU32,
    value: AtomicIsize,
}

impl Completion {
    pub const fn new() -> Self {
        Completion {
            pending: AtomicBool::new(false),
            sequence: AtomicU32::new(0),
            taken: AtomicU32::new(0),
            events: AtomicU32::new(0),
            value: AtomicIsize::new(0),
        }
    }

    /// Mark the completion as pending
    ///
    /// Drivers call this when they keep the completion for later.
    pub fn arm(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Indicates if a driver holds this completion
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Complete with the `events` that fired, and a result
    ///
    /// Overwrites an earlier outcome that nobody took. Only one context may
    /// complete a given slot at a time; drivers do it under `&mut self`.
    pub fn complete(&self, events: Events, result: Result<usize, Error>) {
        let value = match result {
            Ok(count) => count.min(isize::MAX as usize) as isize,
            Err(error) => -(error.errno() as isize),
        };
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.events.store(events.bits(), Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
        self.pending.store(false, Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(2), Ordering::Release);
    }

    /// Indicates if an outcome is waiting
    pub fn is_complete(&self) -> bool {
        self.sequence.load(Ordering::Acquire) != self.taken.load(Ordering::Relaxed)
    }

    /// Take the outcome, if the driver completed
    ///
    /// Returns `None` while pending or idle. Each outcome is taken once, and
    /// always as one driver reported it.
    pub fn take(&self) -> Option<Outcome> {
        let taken = self.taken.load(Ordering::Relaxed);
        let (sequence, events, value) = loop {
            let sequence = self.sequence.load(Ordering::Acquire);
            if sequence == taken {
                return None;
            }
            if sequence & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let events = self.events.load(Ordering::Relaxed);
            let value = self.value.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) == sequence {
                break (sequence, events, value);
            }
        };
        self.taken.store(sequence, Ordering::Relaxed);

        let result = if value < 0 {
            Err(Error::from_errno(-value as i32).unwrap_or(Error::NotSupported))
        } else {
            Ok(value as usize)
        };
        Some(Outcome {
            events: Events::from_bits_truncate(events),
            result,
        })
    }

    /// Drop a pending completion, and any outcome nobody took
    pub fn cancel(&self) {
        self.pending.store(false, Ordering::Release);
        let sequence = self.sequence.load(Ordering::Acquire);
        if sequence & 1 == 0 {
            self.taken.store(sequence, Ordering::Relaxed);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep `completion` in a driver's pending `slot`
///
/// A different completion already in the slot is completed with
/// `CANCELED`, so its owner isn't left waiting. Re-issuing a transfer with
/// the same completion keeps it pending.
pub fn replace_pending(slot: &mut Option<&'static Completion>, completion: &'static Completion) {
    if let Some(previous) = slot.replace(completion) {
        if !core::ptr::eq(previous, completion) {
            previous.complete(Events::CANCELED, Ok(0));
        }
    }
}
