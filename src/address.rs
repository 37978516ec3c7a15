//! Addresses of replicated databases.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::Hash;

/// Path prefix of every database address.
pub const ADDRESS_PREFIX: &str = "holdfast";

/// The address of a database: the content hash of its manifest.
///
/// Rendered as `/holdfast/<hash>`. The address alone is enough to fetch the
/// manifest from the block layer and decide whether to replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbAddress(Hash);

impl DbAddress {
    /// The address of the database whose manifest has the given hash.
    pub fn from_hash(hash: Hash) -> Self {
        Self(hash)
    }

    /// The manifest hash this address points at.
    pub fn hash(&self) -> &Hash {
        &self.0
    }

    /// The address as a file name fragment, `/` replaced by `_`.
    ///
    /// Reversible: the remaining characters (the prefix and the base32
    /// hash) never contain `_`, so mapping `_` back to `/` restores the
    /// address.
    pub fn escaped(&self) -> String {
        self.to_string().replace('/', "_")
    }
}

impl fmt::Display for DbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", ADDRESS_PREFIX, self.0)
    }
}

impl FromStr for DbAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .and_then(|s| s.strip_prefix(ADDRESS_PREFIX))
            .and_then(|s| s.strip_prefix('/'))
            .ok_or_else(|| anyhow::anyhow!("missing /{}/ prefix", ADDRESS_PREFIX))?;
        let hash: Hash = rest.parse()?;
        Ok(Self(hash))
    }
}

impl From<Hash> for DbAddress {
    fn from(hash: Hash) -> Self {
        Self(hash)
    }
}

impl Serialize for DbAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DbAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let addr = DbAddress::from_hash(Hash::new(b"a manifest"));
        let text = addr.to_string();
        assert!(text.starts_with("/holdfast/"));
        let back: DbAddress = text.parse().unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<DbAddress>().is_err());
        assert!("/holdfast/".parse::<DbAddress>().is_err());
        assert!("/elsewhere/abc".parse::<DbAddress>().is_err());
        assert!("holdfast/abc".parse::<DbAddress>().is_err());
        assert!("/holdfast/not-a-hash".parse::<DbAddress>().is_err());
    }

    #[test]
    fn test_escaping_is_reversible() {
        let addr = DbAddress::from_hash(Hash::new(b"escape me"));
        let escaped = addr.escaped();
        assert!(!escaped.contains('/'));
        let restored: DbAddress = escaped.replace('_', "/").parse().unwrap();
        assert_eq!(restored, addr);
    }
}
