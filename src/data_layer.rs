//! The boundary to the peer-to-peer data layer.
//!
//! Everything this crate consumes from the replication substrate — opening
//! databases, content-addressed blocks, broadcast topics, peer lifecycle
//! events — goes through the [`DataLayer`] trait. The crate ships one
//! implementation, [`mem::MemDataLayer`], an in-process layer for tests and
//! ephemeral nodes; hosts bring their own for real networks.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_lite::Stream;

use crate::address::DbAddress;
use crate::entry::SignedDoc;
use crate::hash::Hash;
use crate::keys::Identity;
use crate::manifest::DbKind;
use crate::store::StorageSet;

pub mod mem;

/// Stream of messages received on a broadcast topic.
///
/// Dropping the stream ends the subscription.
pub type TopicStream = Pin<Box<dyn Stream<Item = TopicMessage> + Send + 'static>>;

/// Stream of peer lifecycle events.
pub type PeerEventStream = Pin<Box<dyn Stream<Item = PeerEvent> + Send + 'static>>;

/// A message received on a broadcast topic.
#[derive(derive_more::Debug, Clone)]
pub struct TopicMessage {
    /// The raw bytes of the message.
    #[debug("Bytes({})", self.content.len())]
    pub content: Bytes,
    /// Short id of the peer that delivered the message, if known.
    pub delivered_from: Option<String>,
}

/// Peer connection lifecycle events.
///
/// Consumed for observability counters only; nothing in this crate derives
/// correctness from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer was discovered.
    Discovered(String),
    /// A connection to a peer was established.
    Connected(String),
    /// A connection to a peer was lost.
    Disconnected(String),
}

/// Options for [`DataLayer::open`].
#[derive(Debug, Default)]
pub struct OpenOptions {
    /// Storage the engine should run the database on. When `None`, the data
    /// layer picks its own default storage.
    pub storage: Option<StorageSet>,
}

impl OpenOptions {
    /// Open on the given storage set.
    pub fn with_storage(storage: StorageSet) -> Self {
        Self {
            storage: Some(storage),
        }
    }
}

/// Handle to an open database.
///
/// The engine behind these operations (log merge, indexing, sync) lives in
/// the data layer; this crate only relies on the thin surface below.
#[async_trait]
pub trait Database: Debug + Send + Sync + 'static {
    /// The address of this database.
    fn address(&self) -> &DbAddress;

    /// The name from the manifest, owner key segment included.
    fn name(&self) -> &str;

    /// Which engine the database runs.
    fn kind(&self) -> DbKind;

    /// Store a document.
    async fn put(&self, doc: SignedDoc) -> Result<()>;

    /// The document stored under `doc_id`, if any.
    async fn get(&self, doc_id: &str) -> Result<Option<SignedDoc>>;

    /// All documents currently in the database.
    async fn all(&self) -> Result<Vec<SignedDoc>>;
}

/// The peer-to-peer data layer this crate runs on top of.
#[async_trait]
pub trait DataLayer: Debug + Send + Sync + 'static {
    /// The identity this node authors with.
    fn identity(&self) -> &Identity;

    /// Open the database at `address` and begin replicating it.
    ///
    /// Idempotent per address within a process: a second open returns the
    /// already-open handle rather than a fresh instance.
    async fn open(&self, address: &DbAddress, opts: OpenOptions) -> Result<Arc<dyn Database>>;

    /// The block with the given content hash, from local storage or peers.
    async fn get_block(&self, hash: &Hash) -> Result<Option<Bytes>>;

    /// Store a block under its content hash, optionally pinned so garbage
    /// collection keeps it.
    async fn put_block(&self, hash: Hash, data: Bytes, pin: bool) -> Result<()>;

    /// Drop the pin on a block. The block may survive until collected.
    async fn unpin_block(&self, hash: &Hash) -> Result<()>;

    /// Subscribe to a broadcast topic.
    async fn subscribe(&self, topic: &str) -> Result<TopicStream>;

    /// Publish `data` on a broadcast topic.
    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    /// Peer connection lifecycle events, for observability.
    fn peer_events(&self) -> PeerEventStream;
}

/// Supplies the data layer the pin coordinator runs on.
///
/// The coordinator may live in an execution context separate from the
/// foreground application, so it takes a provider at construction instead
/// of a handle. Pass an `Arc<dyn DataLayer>` directly to share an existing
/// handle, or a provider that constructs one on first use.
#[async_trait]
pub trait DataLayerProvider: Debug + Send + Sync + 'static {
    /// The data layer to use.
    async fn data_layer(&self) -> Result<Arc<dyn DataLayer>>;
}

#[async_trait]
impl DataLayerProvider for Arc<dyn DataLayer> {
    async fn data_layer(&self) -> Result<Arc<dyn DataLayer>> {
        Ok(self.clone())
    }
}
