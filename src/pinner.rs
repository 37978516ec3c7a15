//! The pin coordinator.
//!
//! A long-lived background service, independent of the foreground
//! application's lifecycle. It subscribes to a well-known broadcast topic,
//! and for every [`PinRequest`] received there it fetches the named
//! database's manifest by content hash, checks that the manifest declares
//! the expected access controller, builds the per-database
//! [`StorageSet`](crate::StorageSet) and opens the database through the data
//! layer — which begins replicating it in the background. Each request is
//! handled independently; a bad request is logged and discarded, never
//! crashing the coordinator or blocking later requests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, error_span, Instrument};

use crate::access::CONTROLLER_ADDRESS;
use crate::address::DbAddress;
use crate::data_layer::{DataLayer, DataLayerProvider};

use self::actor::{PinActor, ToPinActor};

mod actor;

/// Capacity of the channel for messages to the actor.
const ACTOR_CHANNEL_CAP: usize = 64;

/// The broadcast topic pin requests travel on.
pub const DEFAULT_TOPIC: &str = "pindb";

/// Default capacity of each cache tier built for a pinned database.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default interval of the liveness tick that keeps the actor's execution
/// context alive between requests.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for a [`Pinner`].
#[derive(Debug, Clone)]
pub struct PinnerOptions {
    /// Topic to listen for pin requests on.
    pub topic: String,
    /// Directory the durable stores of pinned databases live under.
    pub root: PathBuf,
    /// Capacity of each cache tier.
    pub cache_capacity: usize,
    /// Liveness tick interval.
    pub liveness_interval: Duration,
    /// Access controller a manifest must declare, compared for exact
    /// equality, to be pinned.
    pub controller_address: String,
}

impl PinnerOptions {
    /// Defaults, with durable stores under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            root: root.into(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            controller_address: CONTROLLER_ADDRESS.to_string(),
        }
    }
}

/// A replication request received over the broadcast topic.
///
/// Ephemeral: never persisted, and triggers at most one replication attempt
/// per receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRequest {
    /// Address of the database to replicate.
    #[serde(rename = "dbAddress", alias = "dbaddr")]
    pub db_address: String,
}

impl PinRequest {
    /// A request to pin the database at `address`.
    pub fn new(address: &DbAddress) -> Self {
        Self {
            db_address: address.to_string(),
        }
    }

    /// Decode a request from a topic message.
    ///
    /// Tolerates one level of double encoding: some producers publish the
    /// request JSON wrapped in a JSON string.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if let Ok(req) = serde_json::from_slice::<Self>(bytes) {
            return Ok(req);
        }
        let inner: String =
            serde_json::from_slice(bytes).context("payload is not a pin request")?;
        serde_json::from_str(&inner).context("double-encoded payload is not a pin request")
    }

    /// Encode for publishing.
    pub fn encode(&self) -> Bytes {
        serde_json::to_vec(self)
            .expect("pin requests serialize to JSON")
            .into()
    }

    /// The address the request names.
    pub fn address(&self) -> Result<DbAddress> {
        self.db_address.parse()
    }
}

/// Ask the peers listening on `topic` to replicate the database at
/// `address`.
pub async fn request_pin(
    data_layer: &dyn DataLayer,
    topic: &str,
    address: &DbAddress,
) -> Result<()> {
    data_layer
        .publish(topic, PinRequest::new(address).encode())
        .await
}

/// Handle to the pin coordination service.
///
/// Cheaply cloneable; all clones control the same coordinator. [`start`] and
/// [`stop`] are idempotent, and the coordinator survives any number of
/// stop/start cycles.
///
/// [`start`]: Pinner::start
/// [`stop`]: Pinner::stop
#[derive(Debug, Clone)]
pub struct Pinner {
    provider: Arc<dyn DataLayerProvider>,
    options: Arc<PinnerOptions>,
    running: Arc<Mutex<Option<Running>>>,
}

#[derive(Debug)]
struct Running {
    tx: mpsc::Sender<ToPinActor>,
    task: JoinHandle<()>,
}

impl Pinner {
    /// A coordinator resolving its data layer through `provider`.
    ///
    /// Pass an existing `Arc<dyn DataLayer>` to share a handle with the
    /// foreground application, or a provider that constructs one on first
    /// use when the coordinator runs in its own execution context.
    pub fn new(provider: impl DataLayerProvider, options: PinnerOptions) -> Self {
        Self {
            provider: Arc::new(provider),
            options: Arc::new(options),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the coordinator. A no-op if it is already running.
    ///
    /// Returns once the actor is subscribed to the topic, so a subscribe
    /// failure surfaces here, exactly once, for the host's startup path to
    /// log as a warning.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let data_layer = self
            .provider
            .data_layer()
            .await
            .context("resolving data layer")?;
        let topic = data_layer
            .subscribe(&self.options.topic)
            .await
            .with_context(|| format!("subscribing to topic {:?}", self.options.topic))?;
        let me = data_layer.identity().id().to_string();

        let (tx, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
        let actor = PinActor::new(data_layer, inbox, self.options.clone());
        let task = tokio::task::spawn(
            async move {
                if let Err(err) = actor.run(topic).await {
                    error!("pin actor failed: {err:?}");
                }
            }
            .instrument(error_span!("pinner", %me)),
        );

        *running = Some(Running { tx, task });
        Ok(())
    }

    /// Stop the coordinator. A no-op if it is not running.
    ///
    /// Graceful: in-flight replications complete or fail on their own
    /// before the actor unsubscribes and exits.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { tx, task }) = self.running.lock().await.take() else {
            return Ok(());
        };
        let (reply, reply_rx) = oneshot::channel();
        if tx.send(ToPinActor::Shutdown { reply }).await.is_ok() {
            reply_rx.await.ok();
        }
        task.await.context("joining pin actor task")?;
        Ok(())
    }

    /// Whether the coordinator is currently running.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::hash::Hash;

    #[test]
    fn test_decode_plain_and_double_encoded() {
        let address = DbAddress::from_hash(Hash::new(b"db"));
        let req = PinRequest::new(&address);

        let plain = req.encode();
        assert_eq!(PinRequest::decode(&plain).unwrap(), req);
        assert_eq!(req.address().unwrap(), address);

        let doubled = serde_json::to_vec(&String::from_utf8(plain.to_vec()).unwrap()).unwrap();
        assert_eq!(PinRequest::decode(&doubled).unwrap(), req);
    }

    #[test]
    fn test_decode_accepts_short_field_name() {
        let address = DbAddress::from_hash(Hash::new(b"db"));
        let bytes = format!(r#"{{"dbaddr":"{address}"}}"#);
        let req = PinRequest::decode(bytes.as_bytes()).unwrap();
        assert_eq!(req.address().unwrap(), address);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PinRequest::decode(b"").is_err());
        assert!(PinRequest::decode(b"not json").is_err());
        assert!(PinRequest::decode(b"{}").is_err());
        // double-encoded garbage
        assert!(PinRequest::decode(br#""{\"other\":1}""#).is_err());
        // triple encoding is out of tolerance
        let address = DbAddress::from_hash(Hash::new(b"db"));
        let once = serde_json::to_string(&PinRequest::new(&address)).unwrap();
        let twice = serde_json::to_string(&once).unwrap();
        let thrice = serde_json::to_vec(&twice).unwrap();
        assert!(PinRequest::decode(&thrice).is_err());
    }
}
