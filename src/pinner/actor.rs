//! The actor behind a [`Pinner`](super::Pinner).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_lite::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::address::DbAddress;
use crate::data_layer::{DataLayer, OpenOptions, PeerEvent, TopicMessage, TopicStream};
use crate::manifest::ManifestStore;
use crate::store::StorageSet;

use super::{PinRequest, PinnerOptions};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use iroh_metrics::inc;

/// Messages to the pin actor.
#[derive(derive_more::Debug, strum::Display)]
pub(super) enum ToPinActor {
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// How a single pin attempt ended, short of an error.
#[derive(Debug)]
enum PinOutcome {
    Pinned,
    Mismatch { tag: String },
}

type PinDone = (DbAddress, Result<PinOutcome>);

pub(super) struct PinActor {
    data_layer: Arc<dyn DataLayer>,
    manifests: ManifestStore,
    inbox: mpsc::Receiver<ToPinActor>,
    options: Arc<PinnerOptions>,
    /// Addresses with a replication attempt in flight.
    pending: HashSet<DbAddress>,
    /// Addresses already opened for replication.
    pinned: HashSet<DbAddress>,
    /// In-flight replication tasks.
    pin_tasks: JoinSet<PinDone>,
}

impl PinActor {
    pub(super) fn new(
        data_layer: Arc<dyn DataLayer>,
        inbox: mpsc::Receiver<ToPinActor>,
        options: Arc<PinnerOptions>,
    ) -> Self {
        let manifests = ManifestStore::new(data_layer.clone());
        Self {
            data_layer,
            manifests,
            inbox,
            options,
            pending: Default::default(),
            pinned: Default::default(),
            pin_tasks: Default::default(),
        }
    }

    /// Run until shutdown.
    ///
    /// The caller subscribed `topic` already; dropping it at the end of the
    /// run ends the subscription.
    pub(super) async fn run(mut self, mut topic: TopicStream) -> Result<()> {
        let mut peer_events = self.data_layer.peer_events();
        let mut liveness = tokio::time::interval(self.options.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reply = loop {
            #[cfg(feature = "metrics")]
            inc!(Metrics, pinner_tick_main);
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let msg = msg.context("inbox closed")?;
                    trace!(%msg, "tick: inbox");
                    match msg {
                        ToPinActor::Shutdown { reply } => break reply,
                    }
                }
                msg = topic.next() => {
                    trace!("tick: topic");
                    match msg {
                        Some(msg) => self.on_message(msg),
                        None => bail!("pin topic subscription ended"),
                    }
                }
                event = peer_events.next() => {
                    trace!("tick: peer_event");
                    match event {
                        Some(event) => self.on_peer_event(event),
                        // keep selecting on a stream that never ends
                        None => {
                            peer_events = Box::pin(futures_lite::stream::pending::<PeerEvent>());
                        }
                    }
                }
                Some(res) = self.pin_tasks.join_next(), if !self.pin_tasks.is_empty() => {
                    trace!("tick: pin_task");
                    match res {
                        Ok((address, res)) => self.on_pin_finished(address, res),
                        Err(err) => warn!("pin task panicked: {err:?}"),
                    }
                }
                _ = liveness.tick() => {
                    trace!("tick: liveness");
                    #[cfg(feature = "metrics")]
                    inc!(Metrics, pinner_tick_liveness);
                }
            }
        };

        // let in-flight replications complete or fail on their own; aborting
        // mid-open could leave partially initialized storage handles around
        while let Some(res) = self.pin_tasks.join_next().await {
            match res {
                Ok((address, res)) => self.on_pin_finished(address, res),
                Err(err) => warn!("pin task panicked: {err:?}"),
            }
        }
        drop(topic);
        reply.send(()).ok();
        Ok(())
    }

    fn on_message(&mut self, msg: TopicMessage) {
        #[cfg(feature = "metrics")]
        inc!(Metrics, pin_requests_received);
        let from = msg.delivered_from.as_deref().unwrap_or("unknown").to_string();

        let request = match PinRequest::decode(&msg.content) {
            Ok(request) => request,
            Err(err) => {
                warn!(%from, "discarding pin request: {err:#}");
                #[cfg(feature = "metrics")]
                inc!(Metrics, pin_requests_invalid);
                return;
            }
        };
        let address = match request.address() {
            Ok(address) => address,
            Err(err) => {
                warn!(%from, db = %request.db_address, "discarding pin request: {err:#}");
                #[cfg(feature = "metrics")]
                inc!(Metrics, pin_requests_invalid);
                return;
            }
        };

        if self.pinned.contains(&address) || self.pending.contains(&address) {
            debug!(db = %address, "ignoring duplicate pin request");
            #[cfg(feature = "metrics")]
            inc!(Metrics, pin_requests_duplicate);
            return;
        }

        debug!(db = %address, %from, "pin requested");
        self.pending.insert(address);
        let data_layer = self.data_layer.clone();
        let manifests = self.manifests.clone();
        let options = self.options.clone();
        // spawned so validation does not serialize against new arrivals
        self.pin_tasks.spawn(async move {
            let res = pin_database(data_layer, manifests, options, address).await;
            (address, res)
        });
    }

    fn on_pin_finished(&mut self, address: DbAddress, res: Result<PinOutcome>) {
        self.pending.remove(&address);
        match res {
            Ok(PinOutcome::Pinned) => {
                debug!(db = %address, "pinned database");
                self.pinned.insert(address);
                #[cfg(feature = "metrics")]
                inc!(Metrics, databases_pinned);
            }
            Ok(PinOutcome::Mismatch { tag }) => {
                warn!(db = %address, %tag, "not pinning: manifest names a different access controller");
                #[cfg(feature = "metrics")]
                inc!(Metrics, pin_requests_mismatched);
            }
            Err(err) => {
                warn!(db = %address, "pin failed: {err:#}");
                #[cfg(feature = "metrics")]
                inc!(Metrics, pin_failures);
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        debug!(?event, "peer event");
        #[cfg(feature = "metrics")]
        match event {
            PeerEvent::Discovered(_) => inc!(Metrics, peers_discovered),
            PeerEvent::Connected(_) => inc!(Metrics, peers_connected),
            PeerEvent::Disconnected(_) => inc!(Metrics, peers_disconnected),
        }
    }
}

/// Validate one pin request and open the database it names.
async fn pin_database(
    data_layer: Arc<dyn DataLayer>,
    manifests: ManifestStore,
    options: Arc<PinnerOptions>,
    address: DbAddress,
) -> Result<PinOutcome> {
    let manifest = manifests
        .get(address.hash())
        .await?
        .context("manifest not found")?;
    if manifest.access_controller != options.controller_address {
        return Ok(PinOutcome::Mismatch {
            tag: manifest.access_controller,
        });
    }
    let storage = StorageSet::for_database(
        &options.root,
        options.cache_capacity,
        data_layer.clone(),
        &address,
    )?;
    data_layer
        .open(&address, OpenOptions::with_storage(storage))
        .await
        .context("opening database")?;
    Ok(PinOutcome::Pinned)
}
