//! Error types for imgwire.

use thiserror::Error;

use crate::correlation::Failure;

/// Main error type for all link operations.
///
/// Malformed frames and late replies are absorbed by the link and never
/// show up here.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error during socket/channel operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller misuse of the protocol (e.g. JSON data on a binary frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote side (or the timeout) failed the request.
    #[error("Request failed: {0}")]
    Failed(Failure),
}

impl From<Failure> for LinkError {
    fn from(failure: Failure) -> Self {
        LinkError::Failed(failure)
    }
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
