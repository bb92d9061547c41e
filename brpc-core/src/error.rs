//! Error types for brpc
//!
//! Errors are grouped in families so callers can react to the family
//! (`is_caller_side`, `is_callee_side`, `is_retryable`) instead of matching
//! every variant.

use std::time::Duration;

/// Standard error type for brpc operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Local transport problem: no connection, inactive or not writable
    #[error("Channel error: {0}")]
    Channel(String),

    /// Failure raised to the calling task before or while waiting for a response
    #[error("Caller side error: {0}")]
    CallerSide(String),

    /// The remote side reported an application error
    #[error("Callee side error: {0}")]
    CalleeSide(String),

    /// No response within the caller's timeout
    #[error("Timeout waiting for {service}#{method} on {peer} after {timeout_ms}ms")]
    Timeout {
        peer: String,
        service: String,
        method: String,
        timeout_ms: u64,
    },

    /// Malformed request received by the callee
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request routed to a service or method that is not registered
    #[error("Service not found: {service}#{method}")]
    ServiceNotFound { service: String, method: String },

    /// The service handler itself failed
    #[error("Service invocation failed: {0}")]
    ServiceInvocation(String),

    /// Wire-level decode error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid setup, such as two methods sharing a name without an alias
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The component was already shut down
    #[error("Closed: {0}")]
    Closed(String),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => Error::Channel(error.to_string()),
            _ => Error::Io(error.to_string()),
        }
    }
}

/// Result type for brpc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes that can be used for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Channel = 1,
    CallerSide = 2,
    CalleeSide = 3,
    Timeout = 4,
    BadRequest = 5,
    ServiceNotFound = 6,
    ServiceInvocation = 7,
    Protocol = 8,
    Serialization = 9,
    Configuration = 10,
    Io = 11,
    Cancelled = 12,
    Closed = 13,
}

impl Error {
    /// Build a timeout error for a call
    pub fn timeout(peer: impl ToString, service: &str, method: &str, timeout: Duration) -> Self {
        Error::Timeout {
            peer: peer.to_string(),
            service: service.to_string(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Channel(_) => ErrorCode::Channel,
            Error::CallerSide(_) => ErrorCode::CallerSide,
            Error::CalleeSide(_) => ErrorCode::CalleeSide,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::BadRequest(_) => ErrorCode::BadRequest,
            Error::ServiceNotFound { .. } => ErrorCode::ServiceNotFound,
            Error::ServiceInvocation(_) => ErrorCode::ServiceInvocation,
            Error::Protocol(_) => ErrorCode::Protocol,
            Error::Serialization(_) => ErrorCode::Serialization,
            Error::Configuration(_) => ErrorCode::Configuration,
            Error::Io(_) => ErrorCode::Io,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::Closed(_) => ErrorCode::Closed,
        }
    }

    /// Check if a write that failed with this error may be retried on a new connection
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Channel(_) | Error::Io(_))
    }

    /// Errors produced locally without the peer being involved
    pub fn is_caller_side(&self) -> bool {
        matches!(
            self,
            Error::Channel(_)
                | Error::CallerSide(_)
                | Error::Timeout { .. }
                | Error::Configuration(_)
                | Error::Cancelled
                | Error::Closed(_)
        )
    }

    /// Errors reported by the remote side
    pub fn is_callee_side(&self) -> bool {
        matches!(
            self,
            Error::CalleeSide(_)
                | Error::BadRequest(_)
                | Error::ServiceNotFound { .. }
                | Error::ServiceInvocation(_)
        )
    }

    /// Request mistakes are logged at a lower severity than handler failures
    pub fn is_request_error(&self) -> bool {
        matches!(self, Error::BadRequest(_) | Error::ServiceNotFound { .. })
    }
}
