//! Error types for wasession.

use thiserror::Error;

/// Main error type for all socket and lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame payload is larger than the protocol allows.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending payload (declared or actual).
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Frame socket is closed.
    #[error("frame socket is closed")]
    SocketClosed,

    /// Frame socket is already open.
    #[error("frame socket is already open")]
    SocketAlreadyOpen,

    /// Protocol error (malformed header, desynchronized stream, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Writer task is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The live stream was closed by a server stream error.
    #[error("stream closed")]
    StreamClosed,

    /// Session store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Server request (IQ) failed.
    #[error("request failed: {0}")]
    Request(String),

    /// Rotating credential refresh failed.
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),

    /// Configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rotating credential refresh did not finish before its deadline.
    #[error("credential refresh timed out")]
    RefreshTimeout,
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
