//! # nelson-store
//!
//! Document store for the Nelson daemon.
//!
//! This crate provides a RocksDB-backed key/value store with column
//! families for peer documents and daemon metadata, plus a temporary mode
//! backed by a throwaway directory.

mod database;
mod error;

pub use database::{ColumnFamily, Database};
pub use error::{StoreError, StoreResult};

/// Storage trait for abstracting database operations.
///
/// This allows for easy testing with mock implementations.
pub trait Store: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<()>;

    /// Check if a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Read all entries of a column family.
    fn iter(&self, cf: ColumnFamily) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Remove every entry of a column family.
    fn clear(&self, cf: ColumnFamily) -> StoreResult<()>;
}
