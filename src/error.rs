//! Driver errors, and the C-style status convention
//!
//! Every driver operation returns a `Result`. Callers that need the classic
//! `int` contract (`0` or a positive byte count on success, `-1` on failure
//! with the reason in a last-error slot) convert through [`LastError`].

use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

/// `errno` for an invalid argument (newlib numbering)
pub const EINVAL: i32 = 22;
/// `errno` for an unsupported operation (newlib numbering)
pub const ENOTSUP: i32 = 134;

/// The ways a driver operation can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation is structurally impossible right now: the peripheral
    /// is powered down, it can't transfer in that direction, or the driver
    /// declines the request.
    NotSupported,
    /// Bad request code, port number, control structure, or attributes.
    InvalidArgument,
}

impl Error {
    /// Returns the `errno` value for this error
    pub const fn errno(self) -> i32 {
        match self {
            Error::NotSupported => ENOTSUP,
            Error::InvalidArgument => EINVAL,
        }
    }

    /// Recover an error from its `errno` value
    pub const fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            ENOTSUP => Some(Error::NotSupported),
            EINVAL => Some(Error::InvalidArgument),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotSupported => f.write_str("operation not supported"),
            Error::InvalidArgument => f.write_str("invalid argument"),
        }
    }
}

/// A success value that fits the `int` return convention
pub trait IntoStatus {
    fn into_status(self) -> i32;
}

impl IntoStatus for () {
    fn into_status(self) -> i32 {
        0
    }
}

impl IntoStatus for i32 {
    fn into_status(self) -> i32 {
        self
    }
}

impl IntoStatus for usize {
    /// Saturates byte counts that don't fit in an `i32`
    fn into_status(self) -> i32 {
        i32::try_from(self).unwrap_or(i32::MAX)
    }
}

/// The last-error slot
///
/// Owned by whoever exposes the `int` contract (typically one per task
/// or process), and passed by reference. There's no hidden global.
///
/// ```
/// use mcu_periph::error::{Error, LastError, EINVAL};
///
/// static ERRNO: LastError = LastError::new();
///
/// assert_eq!(ERRNO.status(Ok::<usize, Error>(3)), 3);
/// assert_eq!(ERRNO.status(Err::<(), _>(Error::InvalidArgument)), -1);
/// assert_eq!(ERRNO.get(), EINVAL);
/// ```
pub struct LastError(AtomicI32);

impl LastError {
    pub const fn new() -> Self {
        LastError(AtomicI32::new(0))
    }

    /// Record `error` as the last error
    pub fn set(&self, error: Error) {
        self.0.store(error.errno(), Ordering::Relaxed);
    }

    /// Returns the last recorded `errno`, or 0 if nothing failed since
    /// the last [`clear()`](LastError::clear)
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns the last recorded error
    pub fn error(&self) -> Option<Error> {
        Error::from_errno(self.get())
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Convert a driver result into the `int` convention
    ///
    /// Success values pass through. Failures return `-1`, and record the
    /// error in this slot.
    pub fn status<T: IntoStatus>(&self, result: Result<T, Error>) -> i32 {
        match result {
            Ok(value) => value.into_status(),
            Err(error) => {
                self.set(error);
                -1
            }
        }
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, LastError, EINVAL, ENOTSUP};

    #[test]
    fn errno_round_trip() {
        for error in [Error::NotSupported, Error::InvalidArgument] {
            assert_eq!(Error::from_errno(error.errno()), Some(error));
        }
        assert_eq!(Error::from_errno(0), None);
    }

    #[test]
    fn success_leaves_slot_alone() {
        let errno = LastError::new();
        errno.set(Error::NotSupported);
        assert_eq!(errno.status(Ok::<i32, Error>(0x0003_0000)), 0x0003_0000);
        assert_eq!(errno.get(), ENOTSUP);
    }

    #[test]
    fn failure_records_errno() {
        let errno = LastError::new();
        assert_eq!(errno.get(), 0);
        assert_eq!(errno.status(Err::<usize, _>(Error::InvalidArgument)), -1);
        assert_eq!(errno.get(), EINVAL);
        assert_eq!(errno.error(), Some(Error::InvalidArgument));

        errno.clear();
        assert_eq!(errno.error(), None);
    }

    #[test]
    fn byte_counts_saturate() {
        let errno = LastError::new();
        assert_eq!(errno.status(Ok::<usize, Error>(usize::MAX)), i32::MAX);
    }
}
