//! Peer list error types.

use thiserror::Error;

/// Peer list errors.
#[derive(Error, Debug)]
pub enum PeerError {
    /// Store read or write failed.
    #[error("Store error: {0}")]
    Store(#[from] nelson_store::StoreError),

    /// Peer document could not be encoded or decoded.
    #[error("Document error: {0}")]
    Document(#[from] serde_json::Error),

    /// Malformed peer URI or port.
    #[error("Bad peer input: {0}")]
    BadInput(String),

    /// Unknown peer key.
    #[error("Peer not found: {0}")]
    NotFound(u64),
}

/// Result type for peer list operations.
pub type PeerResult<T> = Result<T, PeerError>;
