//! The durable entry tier, on the content-addressed block layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::data_layer::DataLayer;
use crate::hash::Hash;

use super::{IterOptions, KvIter, Storage, StorageError};

/// Storage over the data layer's content-addressed blocks.
///
/// The durable tier for entries: large, immutable, written once and rarely
/// re-read, implicitly deduplicated by content address. Keys are the textual
/// form of the block's [`Hash`]; a key that is not the hash of its value is
/// rejected.
///
/// Deleting unpins rather than erases. Blocks may be shared between
/// databases; an unpinned block survives until the layer collects it.
#[derive(Debug)]
pub struct BlockStorage {
    data_layer: Arc<dyn DataLayer>,
    pin: bool,
    closed: AtomicBool,
}

impl BlockStorage {
    /// Block storage that does not pin what it writes.
    pub fn new(data_layer: Arc<dyn DataLayer>) -> Self {
        Self {
            data_layer,
            pin: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Block storage that pins every written block, so replicated entries
    /// survive garbage collection.
    pub fn pinned(data_layer: Arc<dyn DataLayer>) -> Self {
        Self {
            pin: true,
            ..Self::new(data_layer)
        }
    }

    fn guard(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn parse_key(key: &[u8]) -> Result<Hash, StorageError> {
        let text = std::str::from_utf8(key)
            .map_err(|_| StorageError::InvalidKey("key is not utf-8".into()))?;
        text.parse()
            .map_err(|_| StorageError::InvalidKey(format!("{text:?} is not a block hash")))
    }
}

#[async_trait]
impl Storage for BlockStorage {
    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), StorageError> {
        self.guard()?;
        let hash = Self::parse_key(key)?;
        if Hash::new(&value) != hash {
            return Err(StorageError::InvalidKey(format!(
                "key {hash} is not the content hash of the value"
            )));
        }
        self.data_layer.put_block(hash, value, self.pin).await?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        self.guard()?;
        let hash = Self::parse_key(key)?;
        Ok(self.data_layer.get_block(&hash).await?)
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.guard()?;
        let hash = Self::parse_key(key)?;
        self.data_layer.unpin_block(&hash).await?;
        Ok(())
    }

    async fn iter(&self, _opts: IterOptions) -> Result<KvIter, StorageError> {
        self.guard()?;
        // the block layer is not enumerable through this facade
        Ok(Box::new(std::iter::empty()))
    }

    async fn merge(&self, _other: &dyn Storage) -> Result<(), StorageError> {
        // content addressing makes the layer self-describing
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}
