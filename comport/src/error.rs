//! Error types for comport.
//!
//! Every failure reported by a transport travels as a [`std::io::Error`]
//! (which carries the raw OS code when there is one) and is turned into an
//! [`Error`] by [`Error::from_native`]. Nothing else in the crate looks at
//! native error codes.

use std::io;
use thiserror::Error;

/// Result type for comport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for comport operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The named device does not exist.
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// The device exists but may not be opened (permissions or in use).
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The device is held open by another process with an incompatible sharing mode.
    #[error("Sharing violation: {0}")]
    SharingViolation(String),

    /// `connect` was called on a port that is already connected.
    #[error("Port is already connected")]
    AlreadyConnected,

    /// An operation that needs an open port was called before `connect`.
    #[error("Port is not connected")]
    NotConnected,

    /// The configuration value is out of range or the transport rejected it.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The transport reported a timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was aborted by a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// The transport handle is no longer usable (device removed or closed).
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// The transport cannot perform the requested operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Any native failure without a more specific mapping.
    #[error("Transport error {code}: {message}")]
    Unknown {
        /// Raw OS code, or -1 when the failure carried none.
        code: i32,
        /// Human readable description from the transport.
        message: String,
    },
}

impl Error {
    /// Translate a native transport failure into the typed taxonomy.
    pub fn from_native(err: io::Error) -> Self {
        let message = err.to_string();

        if let Some(code) = err.raw_os_error() {
            if let Some(mapped) = from_os_code(code, &message) {
                return mapped;
            }
        }

        match err.kind() {
            io::ErrorKind::NotFound => Self::PortNotFound(message),
            io::ErrorKind::PermissionDenied => Self::AccessDenied(message),
            io::ErrorKind::ResourceBusy | io::ErrorKind::AddrInUse => {
                Self::SharingViolation(message)
            },
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout(message),
            io::ErrorKind::InvalidInput => Self::InvalidConfiguration(message),
            io::ErrorKind::Interrupted => Self::Cancelled,
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {
                Self::InvalidHandle(message)
            },
            io::ErrorKind::Unsupported => Self::Unsupported(message),
            _ => Self::Unknown {
                code: err
                    .raw_os_error()
                    .unwrap_or(-1),
                message,
            },
        }
    }

    /// Whether this error means the handle is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidHandle(_))
    }
}

#[cfg(windows)]
fn from_os_code(code: i32, message: &str) -> Option<Error> {
    let message = message.to_string();
    match code {
        // ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND
        2 | 3 => Some(Error::PortNotFound(message)),
        // ERROR_ACCESS_DENIED
        5 => Some(Error::AccessDenied(message)),
        // ERROR_INVALID_HANDLE
        6 => Some(Error::InvalidHandle(message)),
        // ERROR_SHARING_VIOLATION
        32 => Some(Error::SharingViolation(message)),
        // ERROR_INVALID_PARAMETER
        87 => Some(Error::InvalidConfiguration(message)),
        // ERROR_SEM_TIMEOUT, ERROR_TIMEOUT
        121 | 1460 => Some(Error::Timeout(message)),
        // ERROR_OPERATION_ABORTED
        995 => Some(Error::Cancelled),
        _ => None,
    }
}

#[cfg(not(windows))]
fn from_os_code(code: i32, message: &str) -> Option<Error> {
    let message = message.to_string();
    match code {
        // ENOENT, ENXIO, ENODEV
        2 | 6 | 19 => Some(Error::PortNotFound(message)),
        // EPERM, EACCES
        1 | 13 => Some(Error::AccessDenied(message)),
        // EBADF, EIO (device unplugged mid-operation)
        5 | 9 => Some(Error::InvalidHandle(message)),
        // EBUSY
        16 => Some(Error::SharingViolation(message)),
        // EINVAL
        22 => Some(Error::InvalidConfiguration(message)),
        // EINTR
        4 => Some(Error::Cancelled),
        // ETIMEDOUT
        110 => Some(Error::Timeout(message)),
        _ => None,
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_native(err)
    }
}

#[cfg(feature = "native")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::from_native(crate::transport::native::driver_error(err))
    }
}
