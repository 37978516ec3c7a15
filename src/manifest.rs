//! Content-addressed database manifests.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::address::DbAddress;
use crate::canonical::to_canonical_vec;
use crate::data_layer::DataLayer;
use crate::hash::Hash;
use crate::keys::{self, AuthorId};

/// Kinds of replicated databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbKind {
    /// Documents indexed by an id field.
    #[serde(rename = "documents")]
    Documents,
    /// Plain key-value records.
    #[serde(rename = "keyvalue")]
    KeyValue,
    /// An append-only event log.
    #[serde(rename = "events")]
    EventLog,
}

/// Immutable descriptor of a database.
///
/// A manifest is created once, when its database is first declared, by the
/// owner or by any peer that needs to address the database before opening
/// it. It is stored in the block layer and addressed by the content hash of
/// its canonical encoding from then on, and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Address of the access controller every entry must satisfy.
    #[serde(rename = "accessController")]
    pub access_controller: String,
    /// Name of the database. The trailing segment carries the owner's key,
    /// see [`keys::owner_key`].
    pub name: String,
    /// Which engine the database runs.
    #[serde(rename = "type")]
    pub kind: DbKind,
}

impl Manifest {
    /// A manifest for the database `name` of the given kind, guarded by the
    /// access controller at `access_controller`.
    pub fn new(
        name: impl Into<String>,
        kind: DbKind,
        access_controller: impl Into<String>,
    ) -> Self {
        Self {
            access_controller: access_controller.into(),
            name: name.into(),
            kind,
        }
    }

    /// The canonical encoding, the exact bytes stored in the block layer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let bytes = to_canonical_vec(self).context("encoding manifest")?;
        Ok(bytes.into())
    }

    /// Decode a manifest from its stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("decoding manifest")
    }

    /// Content hash of the canonical encoding.
    pub fn hash(&self) -> Result<Hash> {
        Ok(Hash::new(self.to_bytes()?))
    }

    /// The address this manifest's database lives at.
    pub fn address(&self) -> Result<DbAddress> {
        Ok(DbAddress::from_hash(self.hash()?))
    }

    /// The owner key embedded in the name, if the name carries a valid one.
    pub fn owner(&self) -> Option<AuthorId> {
        keys::owner_key(&self.name)
    }
}

/// Creates and retrieves manifests in the content-addressed block layer.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    data_layer: Arc<dyn DataLayer>,
}

impl ManifestStore {
    /// A manifest store over the given data layer.
    pub fn new(data_layer: Arc<dyn DataLayer>) -> Self {
        Self { data_layer }
    }

    /// Store `manifest`, pinned so garbage collection keeps it, and return
    /// the address it is retrievable under.
    pub async fn create(&self, manifest: &Manifest) -> Result<DbAddress> {
        let bytes = manifest.to_bytes()?;
        let hash = Hash::new(&bytes);
        self.data_layer
            .put_block(hash, bytes, true)
            .await
            .context("storing manifest")?;
        Ok(DbAddress::from_hash(hash))
    }

    /// Fetch the manifest with the given content hash.
    ///
    /// Returns `None` if the block layer does not hold it (and cannot fetch
    /// it from any peer).
    pub async fn get(&self, hash: &Hash) -> Result<Option<Manifest>> {
        let Some(bytes) = self
            .data_layer
            .get_block(hash)
            .await
            .context("fetching manifest")?
        else {
            return Ok(None);
        };
        let manifest = Manifest::from_bytes(&bytes)?;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use crate::access::CONTROLLER_ADDRESS;
    use crate::data_layer::mem::MemDataLayer;
    use crate::keys::Author;

    use super::*;

    #[test]
    fn test_canonical_encoding() {
        let manifest = Manifest::new("sensors", DbKind::Documents, CONTROLLER_ADDRESS);
        let bytes = manifest.to_bytes().unwrap();
        assert_eq!(
            bytes,
            br#"{"accessController":"/holdfast/access-controller","name":"sensors","type":"documents"}"#.as_ref()
        );
        let back = Manifest::from_bytes(&bytes).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_hash_depends_on_content() {
        let a = Manifest::new("sensors", DbKind::Documents, CONTROLLER_ADDRESS);
        let b = Manifest::new("sensors", DbKind::KeyValue, CONTROLLER_ADDRESS);
        assert_eq!(a.hash().unwrap(), a.hash().unwrap());
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_owner() {
        let author = Author::new(&mut rand::thread_rng());
        let named = Manifest::new(
            format!("sensors-{}", author.id()),
            DbKind::Documents,
            CONTROLLER_ADDRESS,
        );
        assert_eq!(named.owner(), Some(*author.id()));

        let unowned = Manifest::new("sensors", DbKind::Documents, CONTROLLER_ADDRESS);
        assert_eq!(unowned.owner(), None);
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let layer = MemDataLayer::new();
        let store = ManifestStore::new(layer.clone().into_dyn());

        let manifest = Manifest::new("sensors", DbKind::Documents, CONTROLLER_ADDRESS);
        let address = store.create(&manifest).await.unwrap();
        assert_eq!(address, manifest.address().unwrap());

        let fetched = store.get(address.hash()).await.unwrap();
        assert_eq!(fetched, Some(manifest));

        let missing = store.get(&Hash::new(b"no such manifest")).await.unwrap();
        assert_eq!(missing, None);
    }
}
