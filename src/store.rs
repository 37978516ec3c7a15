//! Tiered storage for the database engine.
//!
//! Every open database runs on three logical stores: its append-log heads,
//! its query index, and its raw entries. All three present the same
//! [`Storage`] contract, composed as [`TieredStorage`]: a bounded in-memory
//! cache ([`LruStorage`]) in front of a durable tier. Heads and index are
//! small, frequently re-read records and go to an embedded key-value file
//! ([`RedbStorage`]); entries are large, append-mostly and content-addressed,
//! so they go to the block layer ([`BlockStorage`], pinned).
//!
//! Writes are write-through, never write-back: the durable tier holds the
//! value before `put` returns, so losing the cache never loses committed
//! data.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::address::DbAddress;
use crate::data_layer::DataLayer;

mod blocks;
mod fs;
mod lru;

pub use self::blocks::BlockStorage;
pub use self::fs::RedbStorage;
pub use self::lru::LruStorage;

/// Error type for storage operations.
///
/// A missing key is not an error; reads return `Ok(None)`. Errors mean the
/// store itself is unusable for the operation: it was closed, the key cannot
/// be used with this tier, or the backing store failed.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store was closed; no further operations are possible.
    #[error("storage is closed")]
    Closed,
    /// The key is not usable with this store.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The backing store failed.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Backend(err.into())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Backend(err.into())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        Self::Backend(err.into())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        Self::Backend(err.into())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        Self::Backend(err.into())
    }
}

/// Options for [`Storage::iter`].
///
/// `start` is inclusive, `end` exclusive. `reverse` yields keys in
/// descending order; `limit` caps the number of yielded pairs.
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    /// First key to include.
    pub start: Option<Vec<u8>>,
    /// First key to exclude.
    pub end: Option<Vec<u8>>,
    /// Iterate in descending key order.
    pub reverse: bool,
    /// Maximum number of pairs to yield.
    pub limit: Option<usize>,
}

impl IterOptions {
    /// Everything, in ascending key order.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to keys in `start..end`.
    pub fn range(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Default::default()
        }
    }

    /// Yield in descending key order.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Yield at most `limit` pairs.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A finite, restartable sequence of key/value pairs.
///
/// Each [`Storage::iter`] call yields a fresh one; abandoning it early
/// releases everything it holds.
pub type KvIter = Box<dyn Iterator<Item = Result<(Bytes, Bytes), StorageError>> + Send>;

/// The uniform contract of every storage tier.
///
/// Implemented by the cache tier, both durable tiers and their
/// [`TieredStorage`] composition, so the database engine is indifferent to
/// what actually holds its data.
#[async_trait]
pub trait Storage: Debug + Send + Sync + 'static {
    /// Store `value` under `key`. Durable before returning.
    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), StorageError>;

    /// The value under `key`, or `None` if absent.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// A fresh iterator over the store's pairs, honoring `opts`.
    async fn iter(&self, opts: IterOptions) -> Result<KvIter, StorageError>;

    /// Best-effort: absorb the pairs of `other` into this store.
    ///
    /// Durable tiers are authoritative and self-describing; for them this is
    /// a no-op.
    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError>;

    /// Release underlying handles. Every later operation fails with
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}

/// A bounded cache in front of a durable tier, presenting one [`Storage`].
///
/// Reads check the cache and fall through to the durable tier, populating
/// the cache on the way back. Writes land on the durable tier first.
/// Iteration goes to the durable tier directly; the cache is never assumed
/// complete. Exclusively owned by the database instance it backs.
#[derive(Debug, Clone)]
pub struct TieredStorage {
    cache: Arc<dyn Storage>,
    durable: Arc<dyn Storage>,
}

impl TieredStorage {
    /// Compose `cache` in front of `durable`.
    pub fn new(cache: impl Storage, durable: impl Storage) -> Self {
        Self {
            cache: Arc::new(cache),
            durable: Arc::new(durable),
        }
    }
}

#[async_trait]
impl Storage for TieredStorage {
    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), StorageError> {
        self.durable.put(key, value.clone()).await?;
        self.cache.put(key, value).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        if let Some(value) = self.cache.get(key).await? {
            return Ok(Some(value));
        }
        let Some(value) = self.durable.get(key).await? else {
            return Ok(None);
        };
        self.cache.put(key, value.clone()).await?;
        Ok(Some(value))
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.durable.delete(key).await?;
        self.cache.delete(key).await
    }

    async fn iter(&self, opts: IterOptions) -> Result<KvIter, StorageError> {
        self.durable.iter(opts).await
    }

    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        self.durable.merge(other).await?;
        self.cache.merge(other).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.cache.close().await?;
        self.durable.close().await
    }
}

/// The three stores a database runs on.
#[derive(Debug, Clone)]
pub struct StorageSet {
    /// Append-log heads.
    pub heads: Arc<dyn Storage>,
    /// Query index.
    pub index: Arc<dyn Storage>,
    /// Raw entry data.
    pub entries: Arc<dyn Storage>,
}

impl StorageSet {
    /// Build the per-database stores under `root`.
    ///
    /// Heads and index go to redb files named after the escaped address
    /// ([`DbAddress::escaped`]), so stores of different databases never
    /// collide; entries go to the content-addressed block layer, pinned.
    /// All three are fronted by a cache of `cache_capacity` values.
    ///
    /// Failure to open the durable tier propagates: a database without its
    /// durable stores would silently drop all data.
    pub fn for_database(
        root: &Path,
        cache_capacity: usize,
        data_layer: Arc<dyn DataLayer>,
        address: &DbAddress,
    ) -> Result<Self, StorageError> {
        let escaped = address.escaped();
        let heads = TieredStorage::new(
            LruStorage::new(cache_capacity),
            RedbStorage::persistent(root.join(format!("heads_{escaped}.redb")))?,
        );
        let index = TieredStorage::new(
            LruStorage::new(cache_capacity),
            RedbStorage::persistent(root.join(format!("index_{escaped}.redb")))?,
        );
        let entries = TieredStorage::new(
            LruStorage::new(cache_capacity),
            BlockStorage::pinned(data_layer),
        );
        Ok(Self {
            heads: Arc::new(heads),
            index: Arc::new(index),
            entries: Arc::new(entries),
        })
    }

    /// An ephemeral set: redb on in-memory backends, blocks unpinned.
    pub fn ephemeral(
        cache_capacity: usize,
        data_layer: Arc<dyn DataLayer>,
    ) -> Result<Self, StorageError> {
        let heads = TieredStorage::new(LruStorage::new(cache_capacity), RedbStorage::in_memory()?);
        let index = TieredStorage::new(LruStorage::new(cache_capacity), RedbStorage::in_memory()?);
        let entries = TieredStorage::new(
            LruStorage::new(cache_capacity),
            BlockStorage::new(data_layer),
        );
        Ok(Self {
            heads: Arc::new(heads),
            index: Arc::new(index),
            entries: Arc::new(entries),
        })
    }

    /// Close all three stores.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.heads.close().await?;
        self.index.close().await?;
        self.entries.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fill(store: &dyn Storage, pairs: &[(&str, &str)]) {
        for (k, v) in pairs {
            store
                .put(k.as_bytes(), Bytes::copy_from_slice(v.as_bytes()))
                .await
                .unwrap();
        }
    }

    async fn keys(store: &dyn Storage, opts: IterOptions) -> Vec<String> {
        let iter = store.iter(opts).await.unwrap();
        iter.map(|res| {
            let (k, _) = res.unwrap();
            String::from_utf8(k.to_vec()).unwrap()
        })
        .collect()
    }

    fn tiered() -> TieredStorage {
        TieredStorage::new(LruStorage::new(16), RedbStorage::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_roundtrip_and_delete() {
        let store = tiered();
        store.put(b"k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(
            store.get(b"k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );

        store.delete(b"k").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), None);
        // idempotent
        store.delete(b"k").await.unwrap();
    }

    #[tokio::test]
    async fn test_durability_survives_cache_loss() {
        let durable = Arc::new(RedbStorage::in_memory().unwrap());
        let store = TieredStorage {
            cache: Arc::new(LruStorage::new(16)),
            durable: durable.clone(),
        };
        store.put(b"k", Bytes::from_static(b"v")).await.unwrap();

        // fresh process: same durable tier, new cache
        let store = TieredStorage {
            cache: Arc::new(LruStorage::new(16)),
            durable,
        };
        assert_eq!(
            store.get(b"k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let cache = Arc::new(LruStorage::new(16));
        let durable = Arc::new(RedbStorage::in_memory().unwrap());
        durable.put(b"k", Bytes::from_static(b"v")).await.unwrap();

        let store = TieredStorage {
            cache: cache.clone(),
            durable,
        };
        assert!(cache.get(b"k").await.unwrap().is_none());
        assert!(store.get(b"k").await.unwrap().is_some());
        assert_eq!(
            cache.get(b"k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[tokio::test]
    async fn test_iteration_options() {
        let store = tiered();
        fill(&store, &[("a", "1"), ("b", "2"), ("c", "3")]).await;

        assert_eq!(keys(&store, IterOptions::all()).await, ["a", "b", "c"]);
        assert_eq!(keys(&store, IterOptions::all().with_limit(2)).await, ["a", "b"]);
        assert_eq!(
            keys(&store, IterOptions::all().reversed()).await,
            ["c", "b", "a"]
        );
        assert_eq!(
            keys(&store, IterOptions::all().reversed().with_limit(1)).await,
            ["c"]
        );
        assert_eq!(keys(&store, IterOptions::range("a", "c")).await, ["a", "b"]);
        // restartable: a second call yields a fresh full sequence
        assert_eq!(keys(&store, IterOptions::all()).await, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_iteration_skips_cache_only_state() {
        // the durable tier is authoritative for iteration
        let store = tiered();
        fill(&store, &[("a", "1")]).await;
        store.cache.put(b"zz", Bytes::from_static(b"9")).await.unwrap();
        assert_eq!(keys(&store, IterOptions::all()).await, ["a"]);
    }

    #[tokio::test]
    async fn test_close_rejects_operations() {
        let store = tiered();
        store.put(b"k", Bytes::from_static(b"v")).await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.get(b"k").await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.put(b"k", Bytes::new()).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(store.delete(b"k").await, Err(StorageError::Closed)));
        assert!(matches!(
            store.iter(IterOptions::all()).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_merge_pulls_into_cache() {
        let store = tiered();
        let other = tiered();
        fill(&other, &[("a", "1"), ("b", "2")]).await;

        store.merge(&other).await.unwrap();
        // durable tier is authoritative and untouched
        assert!(keys(&store, IterOptions::all()).await.is_empty());
        // the cache pulled the other side's pairs
        assert_eq!(
            store.cache.get(b"a").await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
    }

    #[tokio::test]
    async fn test_ephemeral_set() {
        let layer = crate::data_layer::mem::MemDataLayer::new();
        let set = StorageSet::ephemeral(8, layer.into_dyn()).unwrap();
        set.index.put(b"k", Bytes::from_static(b"v")).await.unwrap();
        assert!(set.index.get(b"k").await.unwrap().is_some());
        set.close().await.unwrap();
        assert!(matches!(set.index.get(b"k").await, Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_storage_set_files_are_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let layer = crate::data_layer::mem::MemDataLayer::new();
        let a = DbAddress::from_hash(crate::hash::Hash::new(b"db a"));
        let b = DbAddress::from_hash(crate::hash::Hash::new(b"db b"));

        let set_a =
            StorageSet::for_database(dir.path(), 8, layer.clone().into_dyn(), &a).unwrap();
        let set_b =
            StorageSet::for_database(dir.path(), 8, layer.into_dyn(), &b).unwrap();

        set_a.heads.put(b"head", Bytes::from_static(b"a")).await.unwrap();
        set_b.heads.put(b"head", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(
            set_a.heads.get(b"head").await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );
        assert_eq!(
            set_b.heads.get(b"head").await.unwrap(),
            Some(Bytes::from_static(b"b"))
        );

        set_a.close().await.unwrap();
        set_b.close().await.unwrap();
    }
}
