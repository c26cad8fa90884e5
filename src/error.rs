//! Error types for the osmosdr runtime.
//!
//! This module defines [`SdrError`], the error type returned by every public
//! operation, and [`TransportError`], the narrower type transports use to
//! describe a single failed transfer.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidArgument`**: bad buffer geometry, device index or parameter
//!   value. Returned before any hardware is touched.
//! - **`DeviceUnavailable`**: the device could not be opened, refused every
//!   transfer at session start, or disappeared mid-stream.
//! - **`AlreadyRunning`**: a streaming session is already active on the
//!   handle.
//! - **`TransferError`**: a single transfer failed. The streaming engine
//!   absorbs these by resubmitting; only `read_sync` reports them.
//! - **`NotRunning`**: no session is active. `cancel_async` treats this as
//!   success.
//! - **`Unsupported`**, **`Config`** and **`Usb`**: backend capability gaps,
//!   configuration loading failures, and raw libusb errors.
//!
//! Each variant maps to an [`ErrorCode`] for the C surface.

use osmosdr_pool::PoolError;
use thiserror::Error;

/// Result alias for osmosdr operations.
pub type Result<T> = std::result::Result<T, SdrError>;

/// Errors returned by osmosdr operations.
#[derive(Error, Debug)]
pub enum SdrError {
    /// Bad buffer geometry, index or parameter.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Device missing, unopenable, or lost while streaming.
    #[error("Device unavailable: {message}")]
    DeviceUnavailable { message: String },

    /// A streaming session is already active on this handle.
    #[error("A streaming session is already active on this device")]
    AlreadyRunning,

    /// A single transfer failed.
    #[error("Transfer failed: {0}")]
    TransferError(#[from] TransportError),

    /// No streaming session is active.
    #[error("No streaming session is active")]
    NotRunning,

    /// The backend cannot perform this operation.
    #[error("Operation not supported: {message}")]
    Unsupported { message: String },

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// libusb error outside of a streaming transfer.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

impl SdrError {
    /// Shorthand for [`SdrError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`SdrError::DeviceUnavailable`].
    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            message: message.into(),
        }
    }

    /// Shorthand for [`SdrError::Unsupported`].
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Check if this is an argument validation error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// Check if the device is gone or unusable.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }

    /// Check if a session was already active.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }

    /// Numeric code used by the C surface.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::DeviceUnavailable { .. } => ErrorCode::DeviceUnavailable,
            Self::AlreadyRunning => ErrorCode::AlreadyRunning,
            Self::TransferError(_) => ErrorCode::TransferError,
            Self::NotRunning => ErrorCode::NotRunning,
            Self::Unsupported { .. } => ErrorCode::Unsupported,
            Self::Config(_) => ErrorCode::Config,
            #[cfg(feature = "usb")]
            Self::Usb(_) => ErrorCode::Usb,
        }
    }
}

impl From<PoolError> for SdrError {
    fn from(err: PoolError) -> Self {
        if err.is_invalid_geometry() {
            Self::invalid_argument(err.to_string())
        } else {
            // Lend/restore protocol violations are engine bugs, but they must
            // still surface as an error rather than a panic.
            Self::device_unavailable(format!("buffer pool: {err}"))
        }
    }
}

impl From<figment::Error> for SdrError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Failure of one transfer as reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint halted.
    #[error("endpoint stalled")]
    Stall,

    /// No data within the transport's timeout.
    #[error("transfer timed out")]
    Timeout,

    /// Device sent more data than requested.
    #[error("transfer overflow")]
    Overflow,

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Device disconnected.
    #[error("device disconnected")]
    NoDevice,
}

impl TransportError {
    /// True when retrying cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoDevice)
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NoDevice => Self::NoDevice,
            rusb::Error::Pipe => Self::Stall,
            rusb::Error::Timeout => Self::Timeout,
            rusb::Error::Overflow => Self::Overflow,
            other => Self::Io(other.to_string()),
        }
    }
}

/// Status codes of the C surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation successful.
    Success = 0,
    /// Parameter invalid.
    InvalidArgument = -2,
    /// Device not found, not openable, or lost.
    DeviceUnavailable = -5,
    /// Streaming session already active.
    AlreadyRunning = -6,
    /// Operation not supported by the backend.
    Unsupported = -12,
    /// Transfer failed.
    TransferError = -1000,
    /// No streaming session active.
    NotRunning = -1003,
    /// Configuration error.
    Config = -1100,
    /// libusb error.
    Usb = -1200,
}

impl ErrorCode {
    /// Get a human-readable name for the error code.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "OSMOSDR_SUCCESS",
            ErrorCode::InvalidArgument => "OSMOSDR_ERROR_INVALID_ARGUMENT",
            ErrorCode::DeviceUnavailable => "OSMOSDR_ERROR_DEVICE_UNAVAILABLE",
            ErrorCode::AlreadyRunning => "OSMOSDR_ERROR_ALREADY_RUNNING",
            ErrorCode::Unsupported => "OSMOSDR_ERROR_UNSUPPORTED",
            ErrorCode::TransferError => "OSMOSDR_ERROR_TRANSFER",
            ErrorCode::NotRunning => "OSMOSDR_ERROR_NOT_RUNNING",
            ErrorCode::Config => "OSMOSDR_ERROR_CONFIG",
            ErrorCode::Usb => "OSMOSDR_ERROR_USB",
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code as i32
    }
}
