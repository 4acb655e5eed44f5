//! Store error types.

use thiserror::Error;

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying RocksDB error.
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// Column family missing from an opened database.
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Temporary directory could not be created.
    #[error("Temporary store error: {0}")]
    Temporary(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
