//! Error types for LunBridge
//!
//! One error type is shared by the device framework and the iSCSI bridge.
//! Asynchronous paths report it through their completion callback;
//! [`Error::status_code`] gives the integer status those callbacks carry in
//! C-style APIs (negative errno, or the SCSI status of a failed handshake).

use thiserror::Error;

/// Common result type for LunBridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for LunBridge
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not parse URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("not running on an execution context")]
    NoExecContext,

    // Device registry errors
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot shrink device from {current} to {requested} blocks")]
    CannotShrink { current: u64, requested: u64 },

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed during {stage}: status {status}")]
    Handshake { stage: &'static str, status: i32 },

    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    // I/O errors
    #[error("unmap range needs {required} descriptors, limit is {limit}")]
    UnmapRangeTooLarge { required: u64, limit: u32 },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("module is shutting down")]
    Shutdown,
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Integer status for callback-style reporting. Success is 0 and is never
    /// produced here.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_)
            | Self::InvalidUrl { .. }
            | Self::NoExecContext
            | Self::CannotShrink { .. }
            | Self::UnmapRangeTooLarge { .. } => -libc::EINVAL,

            Self::NotFound(_) => -libc::ENODEV,
            Self::AlreadyExists(_) => -libc::EEXIST,
            Self::ResourceExhausted(_) => -libc::ENOMEM,
            Self::Unsupported(_) => -libc::ENOTSUP,
            Self::Shutdown => -libc::ECANCELED,
            Self::Protocol(_) => -libc::EIO,

            Self::Handshake { status, .. } if *status != 0 => *status,
            Self::Handshake { .. } => -libc::EIO,

            Self::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
