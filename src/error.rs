//! Error taxonomy for the transport layer.
//!
//! Synchronous calls report immediate, local failures through
//! [`TransportError`]. Anything that depends on network state is reported
//! exclusively through the event channel (see [`crate::event`]), so a
//! connection loss never surfaces as the return value of an in-flight
//! submission.

use thiserror::Error;

/// Errors reported synchronously by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The factory was given a backend name that is not registered.
    /// Fatal to transport creation.
    #[error("unknown transport backend {0:?}")]
    UnknownBackend(String),

    /// The operation was attempted before connect/accept completed.
    /// Recoverable: retry after a `Connect` or `Accept` event.
    #[error("transport is not connected")]
    NotConnected,

    /// The configured outstanding-request limit was hit. Backpressure
    /// signal: retry after the queue drains.
    #[error("outstanding-request limit exceeded")]
    Overflow,

    /// The backend variant does not implement this capability.
    #[error("operation not supported by this transport backend")]
    Unsupported,

    /// A fragment or record larger than the 31-bit record-marking limit
    /// was requested. Construction error, never produced by the wire.
    #[error("length {0} exceeds the record-marking limit")]
    FrameTooLarge(u64),

    /// A configuration option failed validation.
    #[error("invalid transport option {key:?}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Helper for option validation failures.
    pub fn invalid_option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        TransportError::InvalidOption { key: key.into(), reason: reason.into() }
    }
}
