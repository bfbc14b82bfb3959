//! Error taxonomy for the tty subsystem.
//!
//! Console and OS failures are translated into a [`TtyError`] once, where they
//! happen, and travel upward as ordinary `Result` values. Malformed terminal data
//! (bad escape sequences, broken multibyte input) never produces an error.

use std::io;
use thiserror::Error;

pub const EPERM: i32 = 1;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const ENXIO: i32 = 6;
pub const EBADF: i32 = 9;
pub const EAGAIN: i32 = 11;
pub const EACCES: i32 = 13;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ENOTTY: i32 = 25;
pub const ECANCELED: i32 = 125;

#[derive(Error, Debug)]
pub enum TtyError {
    #[error("I/O error on terminal: {0}")]
    Io(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not permitted: {0}")]
    Permission(String),

    #[error("Not a terminal")]
    NotATty,

    #[error("Bad handle")]
    BadHandle,

    #[error("Device busy")]
    Busy,

    #[error("Canceled")]
    Canceled,

    #[error("No free terminal unit")]
    NoDevice,

    #[error("Failed to create {what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Console error: {0}")]
    Console(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, TtyError>;

impl TtyError {
    /// POSIX errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            TtyError::Io(_) | TtyError::Console(_) | TtyError::Resource { .. } => EIO,
            TtyError::AccessDenied(_) => EACCES,
            TtyError::WouldBlock => EAGAIN,
            TtyError::Interrupted => EINTR,
            TtyError::InvalidArgument(_) => EINVAL,
            TtyError::Permission(_) => EPERM,
            TtyError::NotATty => ENOTTY,
            TtyError::BadHandle => EBADF,
            TtyError::Busy => EBUSY,
            TtyError::Canceled => ECANCELED,
            TtyError::NoDevice => ENXIO,
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        TtyError::Io(msg.into())
    }

    pub fn access(msg: impl Into<String>) -> Self {
        TtyError::AccessDenied(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        TtyError::InvalidArgument(msg.into())
    }

    /// Translate a console API failure.
    pub fn console(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => TtyError::WouldBlock,
            io::ErrorKind::Interrupted => TtyError::Interrupted,
            io::ErrorKind::PermissionDenied => TtyError::AccessDenied(err.to_string()),
            _ => TtyError::Console(err),
        }
    }

    /// True for conditions a caller may retry without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, TtyError::WouldBlock)
    }
}

impl From<io::Error> for TtyError {
    fn from(err: io::Error) -> Self {
        TtyError::console(err)
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for TtyError {
    fn from(err: windows::core::Error) -> Self {
        TtyError::console(io::Error::from_raw_os_error(err.code().0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(TtyError::io("x").errno(), EIO);
        assert_eq!(TtyError::access("x").errno(), EACCES);
        assert_eq!(TtyError::WouldBlock.errno(), EAGAIN);
        assert_eq!(TtyError::Interrupted.errno(), EINTR);
        assert!(TtyError::WouldBlock.is_transient());
        assert!(!TtyError::Interrupted.is_transient());
    }

    #[test]
    fn test_console_translation() {
        let err = TtyError::console(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(err.errno(), EACCES);
        let err = TtyError::console(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, TtyError::Console(_)));
    }
}
