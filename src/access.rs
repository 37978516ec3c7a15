//! The access-control decision every peer makes for every incoming entry.
//!
//! There is no central authority and no consensus round. A database's name
//! carries its owner's public key in the trailing segment; an entry is
//! admitted exactly when its document signature, recomputed over the
//! canonical form of the document's fields, verifies against that key. Every
//! peer reaches the same decision from the entry alone.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::address::DbAddress;
use crate::data_layer::{DataLayer, OpenOptions};
use crate::entry::Entry;
use crate::keys::{self, Identity};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use iroh_metrics::inc;

/// The address databases name in their manifest to select this controller.
pub const CONTROLLER_ADDRESS: &str = "/holdfast/access-controller";

/// Decides whether log entries may be appended to a database.
///
/// Installed once at process start and consulted by the log engine for every
/// append, local or remote. The check is on the hot append path: it never
/// retries, and it suspends only to resolve the referenced database, not for
/// the signature verification itself.
#[derive(Debug, Clone)]
pub struct AccessController {
    data_layer: Arc<dyn DataLayer>,
}

impl AccessController {
    /// A controller resolving databases through the given data layer.
    pub fn new(data_layer: Arc<dyn DataLayer>) -> Self {
        Self { data_layer }
    }

    /// The address this controller is installed under.
    pub fn address(&self) -> &'static str {
        CONTROLLER_ADDRESS
    }

    /// Whether `entry` may be appended to the database it names.
    ///
    /// Fails closed: any verification error — unparseable or unreachable
    /// database address, a name without an owner key segment, malformed or
    /// mismatched signature — is a rejection, never an error or a panic. The
    /// identity context is accepted to conform to the host's controller
    /// shape; the decision is a pure function of the entry.
    pub async fn can_append(&self, entry: &Entry, _identity: Option<&Identity>) -> bool {
        match self.verify_entry(entry).await {
            Ok(()) => {
                trace!(db = %entry.id, "entry admitted");
                #[cfg(feature = "metrics")]
                inc!(Metrics, entries_admitted);
                true
            }
            Err(err) => {
                debug!(db = %entry.id, "entry rejected: {err:#}");
                #[cfg(feature = "metrics")]
                inc!(Metrics, entries_rejected);
                false
            }
        }
    }

    async fn verify_entry(&self, entry: &Entry) -> Result<()> {
        let address: DbAddress = entry
            .id
            .parse()
            .context("entry does not name a database address")?;
        let db = self
            .data_layer
            .open(&address, OpenOptions::default())
            .await
            .context("resolving database")?;
        let owner = keys::owner_key(db.name())
            .with_context(|| format!("database name {:?} carries no owner key", db.name()))?;
        entry
            .payload
            .value
            .verify(&owner)
            .context("verifying document signature")?;
        Ok(())
    }
}
