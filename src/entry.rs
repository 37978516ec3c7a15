//! Log entries and the signed documents they carry.
//!
//! An [`Entry`] is what the replicated log hands to the access controller:
//! the address of the database it belongs to plus an operation payload. The
//! payload value is a [`SignedDoc`], a field map signed over its canonical
//! form by the database owner.

use anyhow::Context;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::address::DbAddress;
use crate::canonical::{to_canonical_json, FieldMap};
use crate::keys::{Author, AuthorId};

/// A single entry of a database's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Address of the database this entry belongs to.
    pub id: String,
    /// The operation carried by this entry.
    pub payload: Payload,
    /// Identity reference attached by the log engine, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Logical position attached by the log engine, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<Clock>,
}

impl Entry {
    /// A new entry for the database at `address`.
    pub fn new(address: &DbAddress, payload: Payload) -> Self {
        Self {
            id: address.to_string(),
            payload,
            identity: None,
            clock: None,
        }
    }
}

/// The operation payload of an [`Entry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// What the entry does.
    pub op: Op,
    /// The document key the operation applies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// The signed document.
    pub value: SignedDoc,
}

impl Payload {
    /// A `PUT` payload storing `value` under `key`.
    pub fn put(key: impl Into<String>, value: SignedDoc) -> Self {
        Self {
            op: Op::Put,
            key: Some(key.into()),
            value,
        }
    }
}

/// Operations a document store log can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    /// Store a document under a key.
    Put,
    /// Remove the document under a key.
    Del,
    /// Append an event (event-log databases).
    Add,
}

/// Logical clock value attached to entries by the log engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    /// Writer the clock belongs to.
    pub id: String,
    /// Monotonic tick of that writer.
    pub time: u64,
}

/// A document plus the owner's signature over its canonical form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDoc {
    /// The document fields.
    pub data: FieldMap,
    /// Hex-encoded ed25519 signature over `to_canonical_json(&data)`.
    pub sig: String,
    /// Document id within the database, if the caller indexes by one.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

impl SignedDoc {
    /// Sign `data` with `author`, producing an admissible document.
    pub fn sign(data: FieldMap, author: &Author) -> Self {
        let sig = author.sign(to_canonical_json(&data).as_bytes());
        Self {
            data,
            sig: hex::encode(sig.to_bytes()),
            doc_id: None,
        }
    }

    /// Attach a document id.
    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    /// Check the signature over the canonical form against `author`.
    pub fn verify(&self, author: &AuthorId) -> anyhow::Result<()> {
        let sig_bytes = hex::decode(&self.sig).context("signature is not hex")?;
        let sig = Signature::from_slice(&sig_bytes).context("signature has wrong length")?;
        let canonical = to_canonical_json(&self.data);
        author.verify(canonical.as_bytes(), &sig)?;
        Ok(())
    }
}
