//! RocksDB document store implementation.

use crate::{Store, StoreError, StoreResult};
use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Column families for organizing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Peer documents indexed by document id.
    Peers,
    /// Daemon metadata (id counters, schema markers).
    Metadata,
    /// Default column family (required by RocksDB).
    Default,
}

impl ColumnFamily {
    /// Get the string name of the column family.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Peers => "peers",
            ColumnFamily::Metadata => "metadata",
            ColumnFamily::Default => "default",
        }
    }

    /// Get all column families.
    pub fn all() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::Peers,
            ColumnFamily::Metadata,
            ColumnFamily::Default,
        ]
    }
}

/// RocksDB database wrapper.
///
/// When opened in temporary mode the backing directory is a [`TempDir`]
/// that is removed when the last clone of the database is dropped.
pub struct Database {
    db: Arc<RwLock<DBWithThreadMode<MultiThreaded>>>,
    _temp_dir: Option<Arc<TempDir>>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        info!("Opening peer store at {:?}", path);

        let db = Self::open_inner(path)?;

        debug!("Peer store opened successfully");

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            _temp_dir: None,
        })
    }

    /// Open a throwaway database in a temporary directory.
    ///
    /// The directory is deleted when the database is dropped.
    pub fn open_temporary() -> StoreResult<Self> {
        let temp_dir = TempDir::new()?;
        info!("Opening temporary peer store at {:?}", temp_dir.path());

        let db = Self::open_inner(temp_dir.path())?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            _temp_dir: Some(Arc::new(temp_dir)),
        })
    }

    fn open_inner(path: &Path) -> StoreResult<DBWithThreadMode<MultiThreaded>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(64);
        opts.set_keep_log_file_num(1);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ColumnFamily::all()
            .iter()
            .map(|cf| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(cf.name(), cf_opts)
            })
            .collect();

        Ok(DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &opts,
            path,
            cf_descriptors,
        )?)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        let db = self.db.read();
        for cf in ColumnFamily::all() {
            if let Some(handle) = db.cf_handle(cf.name()) {
                db.flush_cf(&handle)?;
            }
        }
        Ok(())
    }
}

impl Store for Database {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.name().to_string()))?;

        Ok(db.get_cf(&handle, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.name().to_string()))?;

        db.put_cf(&handle, key, value)?;
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StoreResult<()> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.name().to_string()))?;

        db.delete_cf(&handle, key)?;
        Ok(())
    }

    fn iter(&self, cf: ColumnFamily) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.name().to_string()))?;

        let iter = db.iterator_cf(&handle, rocksdb::IteratorMode::Start);

        Ok(iter
            .filter_map(|r| r.ok())
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect())
    }

    fn clear(&self, cf: ColumnFamily) -> StoreResult<()> {
        let db = self.db.read();
        let handle = db
            .cf_handle(cf.name())
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf.name().to_string()))?;

        let keys: Vec<Vec<u8>> = db
            .iterator_cf(&handle, rocksdb::IteratorMode::Start)
            .filter_map(|r| r.ok())
            .map(|(k, _)| k.to_vec())
            .collect();

        for key in keys {
            db.delete_cf(&handle, &key)?;
        }
        Ok(())
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            _temp_dir: self._temp_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_open_and_write() {
        let db = Database::open_temporary().unwrap();

        db.put(ColumnFamily::Peers, b"key1", b"value1").unwrap();
        let value = db.get(ColumnFamily::Peers, b"key1").unwrap();
        assert_eq!(value, Some(b"value1".to_vec()));

        db.delete(ColumnFamily::Peers, b"key1").unwrap();
        let value = db.get(ColumnFamily::Peers, b"key1").unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_iter_and_clear() {
        let db = Database::open_temporary().unwrap();

        db.put(ColumnFamily::Peers, b"a", b"1").unwrap();
        db.put(ColumnFamily::Peers, b"b", b"2").unwrap();
        db.put(ColumnFamily::Metadata, b"seq", b"3").unwrap();

        let entries = db.iter(ColumnFamily::Peers).unwrap();
        assert_eq!(entries.len(), 2);

        db.clear(ColumnFamily::Peers).unwrap();
        assert!(db.iter(ColumnFamily::Peers).unwrap().is_empty());

        // Other column families are untouched
        assert_eq!(
            db.get(ColumnFamily::Metadata, b"seq").unwrap(),
            Some(b"3".to_vec())
        );
    }

    #[test]
    fn test_temporary_dir_removed_on_drop() {
        let path = {
            let db = Database::open_temporary().unwrap();
            db._temp_dir.as_ref().unwrap().path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
