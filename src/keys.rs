//! Ed25519 keys for database owners.
//!
//! Every database embeds the hex-encoded [`AuthorId`] of its owner in the
//! trailing segment of its name. Only documents signed by the matching
//! [`Author`] are admitted by the access controller.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// An author keypair, able to sign documents.
#[derive(Clone, Serialize, Deserialize)]
pub struct Author {
    signing_key: SigningKey,
    id: AuthorId,
}

impl Author {
    /// Create a new author with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        let id = AuthorId(signing_key.verifying_key());
        Author { signing_key, id }
    }

    /// Restore an author from the raw bytes of its signing key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// Raw bytes of the signing key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public identity of this author.
    pub fn id(&self) -> &AuthorId {
        &self.id
    }

    /// Sign a message with this author's key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    /// Verify that a signature over a message was created by this author.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.id.verify(msg, signature)
    }
}

impl From<SigningKey> for Author {
    fn from(signing_key: SigningKey) -> Self {
        let id = AuthorId(signing_key.verifying_key());
        Self { signing_key, id }
    }
}

impl Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.id)
    }
}

impl Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.id)
    }
}

impl FromStr for Author {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 32] = hex::decode(s)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid key length"))?;
        Ok(SigningKey::from_bytes(&bytes).into())
    }
}

/// The public identity of an [`Author`], a verifying key.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct AuthorId(VerifyingKey);

impl AuthorId {
    /// Restore an identity from the raw bytes of its verifying key.
    ///
    /// Fails if the bytes do not describe a valid curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        Ok(AuthorId(VerifyingKey::from_bytes(bytes)?))
    }

    /// Raw bytes of the verifying key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verify a signature over a message against this identity.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// The first ten hex chars, for log output.
    pub fn fmt_short(&self) -> String {
        let mut text = hex::encode(self.0.as_bytes());
        text.truncate(10);
        text
    }
}

impl Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

impl Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", hex::encode(self.0.as_bytes()))
    }
}

impl FromStr for AuthorId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 32] = hex::decode(s)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid key length"))?;
        Ok(Self::from_bytes(&bytes)?)
    }
}

/// Separator between a database's base name and its owner key segment.
pub const NAME_KEY_SEPARATOR: char = '-';

/// Extract the owner key embedded in a database name.
///
/// The split rule: everything after the last [`NAME_KEY_SEPARATOR`] must be
/// the owner's hex-encoded verifying key. A name without a separator, or
/// whose trailing segment is not a valid key, has no owner and can never
/// admit an entry.
pub fn owner_key(name: &str) -> Option<AuthorId> {
    let (_, segment) = name.rsplit_once(NAME_KEY_SEPARATOR)?;
    segment.parse().ok()
}

/// The identity a node authors with.
///
/// Pairs the signing [`Author`] with its derived short identifier, the form
/// the data layer reports identities in.
#[derive(Debug, Clone)]
pub struct Identity {
    id: String,
    author: Author,
}

impl Identity {
    /// Derive the identity for `author`.
    pub fn new(author: Author) -> Self {
        let id = author.id().fmt_short();
        Self { id, author }
    }

    /// Short identifier, used in logs and peer events.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The keypair behind this identity.
    pub fn author(&self) -> &Author {
        &self.author
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let author = Author::new(&mut rand::thread_rng());
        let msg = b"all that is gold does not glitter";
        let sig = author.sign(msg);
        assert!(author.verify(msg, &sig).is_ok());
        assert!(author.verify(b"tampered", &sig).is_err());

        let other = Author::new(&mut rand::thread_rng());
        assert!(other.verify(msg, &sig).is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        let author = Author::new(&mut rand::thread_rng());
        let id = *author.id();

        let text = id.to_string();
        assert_eq!(text.len(), 64);
        let back: AuthorId = text.parse().unwrap();
        assert_eq!(back, id);

        let author_text = hex::encode(author.to_bytes());
        let restored: Author = author_text.parse().unwrap();
        assert_eq!(restored.id(), &id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not hex at all".parse::<AuthorId>().is_err());
        assert!("abcd".parse::<AuthorId>().is_err());
        // valid hex, wrong length
        assert!(hex::encode([1u8; 16]).parse::<AuthorId>().is_err());
    }

    #[test]
    fn test_owner_key_split_rule() {
        let author = Author::new(&mut rand::thread_rng());
        let id = *author.id();

        assert_eq!(owner_key(&format!("sensors-{id}")), Some(id));
        // the key follows the last separator, names may contain more
        assert_eq!(owner_key(&format!("my-sensors-{id}")), Some(id));

        assert_eq!(owner_key("no separator here"), None);
        assert_eq!(owner_key(&format!("missing-separator{id}X")), None);
        assert_eq!(owner_key("sensors-nothexatall"), None);
        assert_eq!(owner_key(""), None);
    }
}
