//! Error types for relay operations.
//!
//! This module defines error types that can occur during relay
//! communication. Transport failures are handled inside the connection
//! task and surface as status changes; only the variants below reach
//! callers.

use thiserror::Error;

/// Errors that can occur during relay operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Socket-level failure (connect, read, or write).
    #[error("Transport error on {url}: {reason}")]
    Transport {
        /// The relay URL.
        url: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The relay is not currently connected.
    #[error("Relay {0} is not connected")]
    NotConnected(String),

    /// Invalid relay URL.
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// The relay sent a frame that is not valid protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection has been shut down and accepts no more work.
    #[error("Relay connection {0} is closed")]
    Closed(String),

    /// Timeout waiting for operation.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Frame serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
