//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Dial failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote side closed the socket.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed frame or payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Frame exceeds the size cap.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame magic did not match this network.
    #[error("Network magic mismatch")]
    MagicMismatch,

    /// Read deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
