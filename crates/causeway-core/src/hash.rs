//! Centralized hashing for content addressing and chain verification
//!
//! All digests in Causeway are 32-byte SHA-256 outputs. The algorithm is
//! selected once here; call sites use [`hash`] or [`Hasher`] and never name
//! the algorithm directly, so swapping it is a one-file change.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte digest.
///
/// Serialized as a lowercase hex string so digests are readable in the
/// newline-delimited ledger files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// The all-zero digest, used as the chain anchor and the empty-tree root.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Raw bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex digest"))
    }
}

/// Hash arbitrary bytes to a 32-byte digest.
pub fn hash(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// Incremental hasher for multi-part data.
///
/// Useful when hashing ordered sequences (child digests, chained fields)
/// without building an intermediate buffer.
#[derive(Debug, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Create a fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Hash32 {
        Hash32(self.inner.finalize().into())
    }
}
