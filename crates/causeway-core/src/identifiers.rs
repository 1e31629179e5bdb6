//! Core identifier types used across the Causeway engine
//!
//! Uuid-backed newtypes for records that are minted locally (decisions,
//! tokens, snapshots, metering entries), plus the string-backed [`NodeId`]
//! whose total ordering is load-bearing: it is the deterministic tie-break
//! for elections and for reconciliation of concurrent updates.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of one node in the federation.
///
/// The derived `Ord` is total and deterministic; consensus and sync
/// tie-breaks rely on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a logical state partition tracked by the digest tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionName(pub String);

impl PartitionName {
    /// Create a partition name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mint a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID.
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one recorded decision in the decision ledger.
    DecisionId,
    "decision"
);

uuid_id!(
    /// Identifier of one issued authorization token.
    TokenId,
    "token"
);

uuid_id!(
    /// Identifier of one immutable context snapshot.
    SnapshotId,
    "snapshot"
);

uuid_id!(
    /// Identifier of one metering ledger entry.
    EntryId,
    "entry"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_ordering_is_total() {
        let a = NodeId::new("node-a");
        let b = NodeId::new("node-b");
        assert!(a < b);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn display_prefixes() {
        let d = DecisionId::new();
        assert!(d.to_string().starts_with("decision-"));
        let t = TokenId::new();
        assert!(t.to_string().starts_with("token-"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SnapshotId::new(), SnapshotId::new());
    }
}
