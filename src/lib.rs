//! Decision logic and coordination for a node in a peer-to-peer, replicated,
//! append-only document store.
//!
//! Every peer decides independently whether an incoming log entry is
//! admissible: the [`AccessController`] recomputes the canonical form of the
//! entry's document and verifies its signature against the owner key embedded
//! in the database name. There is no consensus round; a database's log is
//! whatever set of correctly signed entries gossip delivers.
//!
//! The database engine reads and writes through [`TieredStorage`], a bounded
//! in-memory cache in front of a durable tier. Writes land on the durable
//! tier before they return; losing the cache never loses committed data.
//!
//! The [`Pinner`] is a background service that listens on a broadcast topic
//! for [`PinRequest`]s, validates each request against the named database's
//! content-addressed [`Manifest`], and opens the database through the
//! peer-to-peer data layer to begin mirroring it. The data layer itself
//! (transport, gossip, replication) sits behind the [`data_layer::DataLayer`]
//! trait.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod access;
pub mod address;
pub mod canonical;
pub mod data_layer;
pub mod entry;
pub mod hash;
pub mod keys;
pub mod manifest;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pinner;
pub mod store;

pub use self::access::AccessController;
pub use self::address::DbAddress;
pub use self::canonical::{to_canonical_json, FieldMap};
pub use self::entry::{Entry, Payload, SignedDoc};
pub use self::hash::Hash;
pub use self::keys::{Author, AuthorId, Identity};
pub use self::manifest::{DbKind, Manifest, ManifestStore};
pub use self::pinner::{Pinner, PinnerOptions, PinRequest};
pub use self::store::{IterOptions, Storage, StorageError, StorageSet, TieredStorage};
