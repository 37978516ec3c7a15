//! The bounded in-memory cache tier.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::{IterOptions, KvIter, Storage, StorageError};

/// A bounded key/value store with least-recently-used eviction.
///
/// The cache tier of a [`super::TieredStorage`]. Usable on its own as a
/// purely ephemeral store; nothing in it survives the process.
#[derive(Debug)]
pub struct LruStorage {
    // None once closed
    cache: Mutex<Option<LruCache<Vec<u8>, Bytes>>>,
}

impl LruStorage {
    /// A cache holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to at least 1");
        Self {
            cache: Mutex::new(Some(LruCache::new(capacity))),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut LruCache<Vec<u8>, Bytes>) -> T) -> Result<T, StorageError> {
        let mut guard = self.cache.lock();
        let cache = guard.as_mut().ok_or(StorageError::Closed)?;
        Ok(f(cache))
    }
}

#[async_trait]
impl Storage for LruStorage {
    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), StorageError> {
        self.with(|cache| {
            cache.put(key.to_vec(), value);
        })
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        // refreshes recency
        self.with(|cache| cache.get(key).cloned())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.with(|cache| {
            cache.pop(key);
        })
    }

    async fn iter(&self, opts: IterOptions) -> Result<KvIter, StorageError> {
        // snapshot in key order; recency is not observable through iteration
        let snapshot: BTreeMap<Vec<u8>, Bytes> = self.with(|cache| {
            cache
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })?;
        let start = opts.start.map_or(Bound::Unbounded, Bound::Included);
        let end = opts.end.map_or(Bound::Unbounded, Bound::Excluded);
        let ranged: Vec<(Bytes, Bytes)> = snapshot
            .range::<Vec<u8>, _>((start, end))
            .map(|(k, v)| (Bytes::from(k.clone()), v.clone()))
            .collect();
        let limit = opts.limit.unwrap_or(usize::MAX);
        let iter: Box<dyn Iterator<Item = (Bytes, Bytes)> + Send> = if opts.reverse {
            Box::new(ranged.into_iter().rev().take(limit))
        } else {
            Box::new(ranged.into_iter().take(limit))
        };
        Ok(Box::new(iter.map(Ok)))
    }

    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        // pull the other side's pairs; capacity pressure evicts as usual
        let iter = other.iter(IterOptions::all()).await?;
        for pair in iter {
            let (key, value) = pair?;
            self.with(|cache| {
                cache.put(key.to_vec(), value);
            })?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.cache.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_eviction_under_capacity_pressure() {
        let store = LruStorage::new(2);
        store.put(b"a", Bytes::from_static(b"1")).await.unwrap();
        store.put(b"b", Bytes::from_static(b"2")).await.unwrap();
        // touch "a" so "b" is the eviction candidate
        store.get(b"a").await.unwrap();
        store.put(b"c", Bytes::from_static(b"3")).await.unwrap();

        assert!(store.get(b"a").await.unwrap().is_some());
        assert!(store.get(b"b").await.unwrap().is_none());
        assert!(store.get(b"c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_iter_is_key_ordered() {
        let store = LruStorage::new(8);
        store.put(b"b", Bytes::from_static(b"2")).await.unwrap();
        store.put(b"a", Bytes::from_static(b"1")).await.unwrap();
        store.put(b"c", Bytes::from_static(b"3")).await.unwrap();

        let keys: Vec<Bytes> = store
            .iter(IterOptions::all())
            .await
            .unwrap()
            .map(|res| res.unwrap().0)
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);

        let reversed: Vec<Bytes> = store
            .iter(IterOptions::all().reversed().with_limit(2))
            .await
            .unwrap()
            .map(|res| res.unwrap().0)
            .collect();
        assert_eq!(reversed, ["c", "b"]);
    }

    #[tokio::test]
    async fn test_merge_respects_capacity() {
        let small = LruStorage::new(2);
        let other = LruStorage::new(8);
        for key in [b"a", b"b", b"c", b"d"] {
            other.put(key, Bytes::from_static(b"x")).await.unwrap();
        }

        small.merge(&other).await.unwrap();
        let kept = small.iter(IterOptions::all()).await.unwrap().count();
        assert_eq!(kept, 2);
    }

    #[tokio::test]
    async fn test_closed() {
        let store = LruStorage::new(2);
        store.close().await.unwrap();
        assert!(matches!(store.get(b"a").await, Err(StorageError::Closed)));
        // closing twice is fine
        store.close().await.unwrap();
    }
}
