use super::{KeyValue, StoreKeyValue};
use crate::beacon::StoreError;

pub use rocksdb::Direction as DbDirection;
pub use rocksdb::IteratorMode;
use rocksdb::{prelude::*, DBCompressionType, WriteBatch, WriteOptions, DB};
use std::{path::Path, sync::Arc};

#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) db: Arc<DB>,
}

impl Store {
    /// Open or create a store at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_db(path.as_ref())
    }

    pub fn open_db(path: &Path) -> Result<Self, StoreError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_compression_type(DBCompressionType::Lz4);
        let db = Arc::new(DB::open(&options, path).map_err(|e| StoreError::Db(e.to_string()))?);
        Ok(Self { db })
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key.as_ref())
            .map(|v| v.map(|vi| vi.to_vec()))
            .map_err(|e| StoreError::Db(e.to_string()))
    }

    pub fn batch(&self) -> Batch {
        Batch {
            db: Arc::clone(&self.db),
            wb: WriteBatch::default(),
        }
    }

    /// Returns an iterator over all items whose key starts with `prefix`.
    pub fn prefix_iterator<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
        self.db
            .get_iter(
                &{
                    let mut opts = ReadOptions::default();
                    opts.set_prefix_same_as_start(true);
                    opts
                },
                IteratorMode::From(prefix, DbDirection::Forward),
            )
            .take_while(move |(col_key, _)| col_key.starts_with(prefix))
    }
}

/// A set of writes applied atomically on commit.
pub struct Batch {
    db: Arc<DB>,
    wb: WriteBatch,
}

impl Batch {
    pub fn put_kv(&mut self, key_value: KeyValue) -> Result<(), StoreError> {
        let value = key_value.value()?;
        self.put(key_value.key(), value)
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> Result<(), StoreError> {
        self.wb
            .put(key, value)
            .map_err(|e| StoreError::Db(e.to_string()))
    }

    /// Write the batch and fsync the WAL before returning.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut write_options = WriteOptions::default();
        write_options.set_sync(true);
        self.db
            .write_opt(&self.wb, &write_options)
            .map_err(|e| StoreError::Db(e.to_string()))
    }
}
