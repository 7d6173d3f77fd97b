use std::io;

use thiserror::Error as ThisError;

/// A type for results generated by channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of errors that can occur when operating a serial channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device is not available.
    ///
    /// This could indicate that the device is in use by another process or
    /// was disconnected while performing I/O.
    NoDevice,

    /// A parameter was incorrect.
    InvalidInput,

    /// The requested configuration is not supported by the platform.
    Unsupported,

    /// An I/O error occurred.
    ///
    /// The type of I/O error is determined by the inner `io::ErrorKind`.
    Io(io::ErrorKind),
}

/// An error type for serial channel operations.
#[derive(Debug, Clone, ThisError)]
#[error("{description}")]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    /// Creates an error of the given kind with a human-readable description.
    pub fn new<T: Into<String>>(kind: ErrorKind, description: T) -> Self {
        Error {
            kind,
            description: description.into(),
        }
    }

    /// Returns the corresponding `ErrorKind` for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable description of the failure.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        let kind = match error.kind {
            ErrorKind::NoDevice => io::ErrorKind::NotFound,
            ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::Io(kind) => kind,
        };

        io::Error::new(kind, error.description)
    }
}

pub(crate) fn last_os_error() -> Error {
    from_io_error(io::Error::last_os_error())
}

pub(crate) fn from_raw_os_error(errno: i32) -> Error {
    use libc::{
        EACCES, EBUSY, EINTR, EINVAL, EISDIR, ELOOP, ENAMETOOLONG, ENODEV, ENOENT, ENOTDIR, ENXIO,
        EWOULDBLOCK,
    };

    let kind = match errno {
        EBUSY | EISDIR | ELOOP | ENOTDIR | ENOENT | ENODEV | ENXIO | EACCES => ErrorKind::NoDevice,
        EINVAL | ENAMETOOLONG => ErrorKind::InvalidInput,

        EINTR => ErrorKind::Io(io::ErrorKind::Interrupted),
        EWOULDBLOCK => ErrorKind::Io(io::ErrorKind::WouldBlock),
        _ => ErrorKind::Io(io::ErrorKind::Other),
    };

    Error::new(kind, io::Error::from_raw_os_error(errno).to_string())
}

pub(crate) fn from_io_error(io_error: io::Error) -> Error {
    match io_error.raw_os_error() {
        Some(errno) => from_raw_os_error(errno),
        None => Error::new(ErrorKind::Io(io_error.kind()), io_error.to_string()),
    }
}
