//! The durable key-value tier, on [`redb`].

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use redb::{
    backends::InMemoryBackend, Database, Range, ReadTransaction, TableDefinition,
};
use tracing::info;

use super::{IterOptions, KvIter, Storage, StorageError};

const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv-1");

/// A durable key-value store backed by a single-file redb database.
///
/// The durable tier for heads and index data: small records, re-read often,
/// updated in place. Every write commits before returning.
#[derive(Debug)]
pub struct RedbStorage {
    // None once closed; the last Arc dropping releases the file handle
    db: Mutex<Option<Arc<Database>>>,
}

impl RedbStorage {
    /// Open (or create) the database file at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("opening key-value store at {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory for {}", path.to_string_lossy()))?;
        }
        let db = Database::builder().create(path)?;
        Self::open(db)
    }

    /// An in-memory database, for ephemeral nodes and tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self, StorageError> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(KV_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self {
            db: Mutex::new(Some(Arc::new(db))),
        })
    }

    fn db(&self) -> Result<Arc<Database>, StorageError> {
        self.db.lock().clone().ok_or(StorageError::Closed)
    }
}

#[async_trait]
impl Storage for RedbStorage {
    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), StorageError> {
        let db = self.db()?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(KV_TABLE)?;
            table.insert(key, value.as_ref())?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        let db = self.db()?;
        let tx = db.begin_read()?;
        let table = tx.open_table(KV_TABLE)?;
        let value = table.get(key)?;
        Ok(value.map(|guard| Bytes::copy_from_slice(guard.value())))
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let db = self.db()?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(KV_TABLE)?;
            table.remove(key)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn iter(&self, opts: IterOptions) -> Result<KvIter, StorageError> {
        let db = self.db()?;
        let tx = db.begin_read()?;
        let table = tx.open_table(KV_TABLE)?;
        let start = opts
            .start
            .as_deref()
            .map_or(Bound::Unbounded, Bound::Included);
        let end = opts.end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        let range = table.range::<&[u8]>((start, end))?;
        Ok(Box::new(TableIter {
            _tx: tx,
            range,
            reverse: opts.reverse,
            remaining: opts.limit.unwrap_or(usize::MAX),
        }))
    }

    async fn merge(&self, _other: &dyn Storage) -> Result<(), StorageError> {
        // the durable tier is authoritative and self-describing
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.db.lock().take();
        Ok(())
    }
}

/// An owned iterator over a table range.
///
/// Holds the read transaction alongside the range so the caller can keep the
/// iterator around, and drop it early, without touching the store again.
struct TableIter {
    _tx: ReadTransaction,
    range: Range<'static, &'static [u8], &'static [u8]>,
    reverse: bool,
    remaining: usize,
}

impl Iterator for TableIter {
    type Item = Result<(Bytes, Bytes), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let next = if self.reverse {
            self.range.next_back()
        } else {
            self.range.next()
        }?;
        self.remaining -= 1;
        Some(next.map_err(StorageError::from).map(|(key, value)| {
            (
                Bytes::copy_from_slice(key.value()),
                Bytes::copy_from_slice(value.value()),
            )
        }))
    }
}
