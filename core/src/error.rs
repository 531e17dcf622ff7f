//! Error types for the transfer pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the transfer pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying stream I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer violated the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A control-message JSON body could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote side reported a rendezvous or pairing failure.
    #[error("{0}")]
    Rendezvous(String),

    /// Configured frame payload size is outside 1..=65535.
    #[error("invalid frame size: {0}")]
    InvalidFrameSize(usize),

    /// Building the TLS session configuration failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// No acknowledgement arrived while frames were outstanding.
    #[error("transfer idle timeout")]
    IdleTimeout,

    /// The transfer shut down while the operation was in progress.
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Shorthand for a wire-format violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
