//! Ledger client error types.

use thiserror::Error;

/// Ledger client errors.
#[derive(Error, Debug)]
pub enum IriError {
    /// Transport failure or timeout.
    #[error("Ledger HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The ledger answered with a non-success status.
    #[error("Ledger RPC failed ({status}): {detail}")]
    Rpc { status: u16, detail: String },

    /// An operation was issued before `start()` completed.
    #[error("Ledger client not available")]
    NotAvailable,
}

/// Result type for ledger operations.
pub type IriResult<T> = Result<T, IriError>;
