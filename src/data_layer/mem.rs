//! In-process data layer.
//!
//! [`MemDataLayer`] keeps blocks, pins and databases in memory and routes
//! broadcast topics over in-process channels. It backs the crate's tests
//! and works for ephemeral single-process nodes; it also records open and
//! subscribe calls so tests can assert on coordinator behavior.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_lite::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::address::DbAddress;
use crate::entry::SignedDoc;
use crate::hash::Hash;
use crate::keys::{Author, Identity};
use crate::manifest::{DbKind, Manifest};

use super::{
    DataLayer, Database, OpenOptions, PeerEvent, PeerEventStream, TopicMessage, TopicStream,
};

/// Capacity of each topic's in-process broadcast channel.
const TOPIC_CHANNEL_CAP: usize = 256;

/// An in-process [`DataLayer`].
///
/// A database becomes openable once its manifest block is present, either
/// written through [`DataLayer::put_block`] (any peer's
/// [`crate::ManifestStore`]) or seeded with [`MemDataLayer::register`].
/// Opening materializes the database from its manifest, exactly once per
/// address.
#[derive(Debug, Clone)]
pub struct MemDataLayer(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    identity: Identity,
    blocks: RwLock<HashMap<Hash, Bytes>>,
    pins: RwLock<HashSet<Hash>>,
    databases: RwLock<HashMap<DbAddress, Arc<MemDatabase>>>,
    topics: Mutex<HashMap<String, broadcast::Sender<TopicMessage>>>,
    subscribe_calls: Mutex<HashMap<String, usize>>,
    peer_events: broadcast::Sender<PeerEvent>,
    opens: Mutex<Vec<DbAddress>>,
    fail_opens: AtomicBool,
}

impl MemDataLayer {
    /// A fresh in-process data layer with a random identity.
    pub fn new() -> Self {
        Self::with_author(Author::new(&mut rand::thread_rng()))
    }

    /// A fresh in-process data layer authoring as `author`.
    pub fn with_author(author: Author) -> Self {
        let (peer_events, _) = broadcast::channel(TOPIC_CHANNEL_CAP);
        Self(Arc::new(Inner {
            identity: Identity::new(author),
            blocks: Default::default(),
            pins: Default::default(),
            databases: Default::default(),
            topics: Default::default(),
            subscribe_calls: Default::default(),
            peer_events,
            opens: Default::default(),
            fail_opens: AtomicBool::new(false),
        }))
    }

    /// This layer as a trait object.
    pub fn into_dyn(self) -> Arc<dyn DataLayer> {
        Arc::new(self)
    }

    /// Seed the manifest for a database so it can be opened, as if a peer
    /// had declared it. Returns the database's address.
    pub fn register(&self, manifest: &Manifest) -> Result<DbAddress> {
        let bytes = manifest.to_bytes()?;
        let hash = Hash::new(&bytes);
        self.0.blocks.write().insert(hash, bytes);
        Ok(DbAddress::from_hash(hash))
    }

    /// The database at `address`, if it has been opened.
    pub fn database(&self, address: &DbAddress) -> Option<Arc<MemDatabase>> {
        self.0.databases.read().get(address).cloned()
    }

    /// Every open call made so far, in order, successful or not.
    pub fn opens(&self) -> Vec<DbAddress> {
        self.0.opens.lock().clone()
    }

    /// How many open calls named `address`.
    pub fn open_count(&self, address: &DbAddress) -> usize {
        self.0.opens.lock().iter().filter(|a| *a == address).count()
    }

    /// How many subscribe calls named `topic`.
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.0
            .subscribe_calls
            .lock()
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// How many subscriptions to `topic` are currently live.
    pub fn active_subscriptions(&self, topic: &str) -> usize {
        self.0
            .topics
            .lock()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Whether the block with `hash` is pinned.
    pub fn pinned(&self, hash: &Hash) -> bool {
        self.0.pins.read().contains(hash)
    }

    /// Make every subsequent open fail, for failure-path tests.
    pub fn set_fail_opens(&self, fail: bool) {
        self.0.fail_opens.store(fail, Ordering::Relaxed);
    }

    /// Emit a peer lifecycle event to all listeners.
    pub fn emit_peer_event(&self, event: PeerEvent) {
        self.0.peer_events.send(event).ok();
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<TopicMessage> {
        self.0
            .topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAP).0)
            .clone()
    }
}

impl Default for MemDataLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataLayer for MemDataLayer {
    fn identity(&self) -> &Identity {
        &self.0.identity
    }

    async fn open(&self, address: &DbAddress, opts: OpenOptions) -> Result<Arc<dyn Database>> {
        self.0.opens.lock().push(*address);
        if self.0.fail_opens.load(Ordering::Relaxed) {
            bail!("injected open failure");
        }
        if let Some(db) = self.0.databases.read().get(address) {
            return Ok(db.clone());
        }
        let manifest = {
            let blocks = self.0.blocks.read();
            let bytes = blocks
                .get(address.hash())
                .with_context(|| format!("unknown database address {address}"))?;
            Manifest::from_bytes(bytes)?
        };
        let db = Arc::new(MemDatabase {
            address: *address,
            name: manifest.name,
            kind: manifest.kind,
            docs: Default::default(),
            storage: Mutex::new(opts.storage),
        });
        self.0.databases.write().insert(*address, db.clone());
        Ok(db)
    }

    async fn get_block(&self, hash: &Hash) -> Result<Option<Bytes>> {
        Ok(self.0.blocks.read().get(hash).cloned())
    }

    async fn put_block(&self, hash: Hash, data: Bytes, pin: bool) -> Result<()> {
        self.0.blocks.write().insert(hash, data);
        if pin {
            self.0.pins.write().insert(hash);
        }
        Ok(())
    }

    async fn unpin_block(&self, hash: &Hash) -> Result<()> {
        self.0.pins.write().remove(hash);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicStream> {
        *self
            .0
            .subscribe_calls
            .lock()
            .entry(topic.to_string())
            .or_default() += 1;
        let receiver = self.topic_sender(topic).subscribe();
        // lagged receivers skip ahead, dropping the missed messages
        let stream = BroadcastStream::new(receiver).filter_map(|res| res.ok());
        Ok(Box::pin(stream))
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let message = TopicMessage {
            content: data,
            delivered_from: Some(self.0.identity.id().to_string()),
        };
        // no receivers is fine, broadcast has no caller to inform
        self.topic_sender(topic).send(message).ok();
        Ok(())
    }

    fn peer_events(&self) -> PeerEventStream {
        let stream = BroadcastStream::new(self.0.peer_events.subscribe()).filter_map(|res| res.ok());
        Box::pin(stream)
    }
}

/// A database held by a [`MemDataLayer`].
#[derive(Debug)]
pub struct MemDatabase {
    address: DbAddress,
    name: String,
    kind: DbKind,
    docs: RwLock<BTreeMap<String, SignedDoc>>,
    storage: Mutex<Option<crate::store::StorageSet>>,
}

impl MemDatabase {
    /// The storage set this database was opened on, if any was supplied.
    pub fn storage(&self) -> Option<crate::store::StorageSet> {
        self.storage.lock().clone()
    }
}

#[async_trait]
impl Database for MemDatabase {
    fn address(&self) -> &DbAddress {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DbKind {
        self.kind
    }

    async fn put(&self, doc: SignedDoc) -> Result<()> {
        let doc_id = doc.doc_id.clone().context("document has no id")?;
        self.docs.write().insert(doc_id, doc);
        Ok(())
    }

    async fn get(&self, doc_id: &str) -> Result<Option<SignedDoc>> {
        Ok(self.docs.read().get(doc_id).cloned())
    }

    async fn all(&self) -> Result<Vec<SignedDoc>> {
        Ok(self.docs.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::access::CONTROLLER_ADDRESS;
    use crate::canonical::FieldMap;

    use super::*;

    fn manifest() -> Manifest {
        Manifest::new("sensors", DbKind::Documents, CONTROLLER_ADDRESS)
    }

    #[tokio::test]
    async fn test_open_requires_manifest() {
        let layer = MemDataLayer::new();
        let address = DbAddress::from_hash(Hash::new(b"nowhere"));
        assert!(layer.open(&address, OpenOptions::default()).await.is_err());
        assert_eq!(layer.open_count(&address), 1);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let layer = MemDataLayer::new();
        let address = layer.register(&manifest()).unwrap();

        let first = layer.open(&address, OpenOptions::default()).await.unwrap();
        let second = layer.open(&address, OpenOptions::default()).await.unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(layer.open_count(&address), 2);
        assert_eq!(layer.opens(), vec![address, address]);

        let mut data = FieldMap::new();
        data.insert("reading".into(), json!(7));
        let author = Author::new(&mut rand::thread_rng());
        let doc = SignedDoc::sign(data, &author).with_doc_id("sensor-1");
        first.put(doc).await.unwrap();
        // both handles see the same database
        assert!(second.get("sensor-1").await.unwrap().is_some());
        assert_eq!(second.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let layer = MemDataLayer::new();
        let mut stream = layer.subscribe("pindb").await.unwrap();
        assert_eq!(layer.subscribe_calls("pindb"), 1);
        assert_eq!(layer.active_subscriptions("pindb"), 1);

        layer.publish("pindb", Bytes::from_static(b"hello")).await.unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.content.as_ref(), b"hello");
        assert_eq!(msg.delivered_from.as_deref(), Some(layer.identity().id()));

        drop(stream);
        assert_eq!(layer.active_subscriptions("pindb"), 0);
    }

    #[tokio::test]
    async fn test_blocks_and_pins() {
        let layer = MemDataLayer::new();
        let hash = Hash::new(b"block");
        assert_eq!(layer.get_block(&hash).await.unwrap(), None);

        layer
            .put_block(hash, Bytes::from_static(b"block"), true)
            .await
            .unwrap();
        assert_eq!(
            layer.get_block(&hash).await.unwrap(),
            Some(Bytes::from_static(b"block"))
        );
        assert!(layer.pinned(&hash));

        layer.unpin_block(&hash).await.unwrap();
        assert!(!layer.pinned(&hash));
        // unpinned, not erased
        assert!(layer.get_block(&hash).await.unwrap().is_some());
    }
}
