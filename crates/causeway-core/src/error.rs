//! Unified error type for the Causeway engine
//!
//! One enum covers the full failure taxonomy so callers can match on the
//! class of failure:
//!
//! - transient peer errors are retried by the federation loops and never
//!   surface from local operations
//! - integrity errors are never silently repaired; the affected structure
//!   enters a degraded state until reconciled
//! - authorization errors are fatal to the specific call and never retried,
//!   since a transparent retry would risk replay
//! - consensus ambiguity surfaces as `NoCoordinator` after a bounded wait
//! - local resource errors block further decisions until the ledger is
//!   writable again

use crate::identifiers::{DecisionId, PartitionName, TokenId};
use serde::{Deserialize, Serialize};

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Unified error type for all engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum EngineError {
    /// A peer did not answer within the allotted timeout.
    #[error("peer timed out: {peer}")]
    PeerTimeout {
        /// Peer that failed to answer.
        peer: String,
    },

    /// A peer is currently unreachable.
    #[error("peer unreachable: {peer}")]
    PeerUnreachable {
        /// Peer that could not be reached.
        peer: String,
    },

    /// Recomputing the decision hash chain diverged from the stored chain.
    #[error("hash chain mismatch at ledger index {index}")]
    ChainMismatch {
        /// Index of the first divergent entry.
        index: usize,
    },

    /// A partition digest still mismatches after retries were exhausted.
    #[error("digest mismatch for partition {partition}")]
    DigestMismatch {
        /// Partition whose digest diverged.
        partition: PartitionName,
    },

    /// Actual after-state does not match before-state plus declared effects.
    #[error("drift violation in component {component}")]
    DriftViolation {
        /// Component whose digest drifted.
        component: String,
    },

    /// The structure is degraded and refuses new writes until reconciled.
    #[error("needs reconciliation: {partition}")]
    NeedsReconciliation {
        /// Partition blocked pending reconciliation.
        partition: PartitionName,
    },

    /// An after-snapshot was already attached to this decision.
    #[error("after snapshot already attached to {decision_id}")]
    AfterSnapshotAlreadyAttached {
        /// Decision that was already closed out.
        decision_id: DecisionId,
    },

    /// The referenced decision does not exist in the ledger.
    #[error("unknown decision: {decision_id}")]
    UnknownDecision {
        /// Decision id that was not found.
        decision_id: DecisionId,
    },

    /// The presented token is not known to this node.
    #[error("unknown token: {token_id}")]
    UnknownToken {
        /// Token id that was not found.
        token_id: TokenId,
    },

    /// The token's lifetime has elapsed.
    #[error("expired token: {token_id}")]
    ExpiredToken {
        /// Token that expired.
        token_id: TokenId,
    },

    /// The token was already consumed; this presentation is a replay.
    #[error("replayed token: {token_id}")]
    ReplayedToken {
        /// Token that was presented a second time.
        token_id: TokenId,
    },

    /// The presented signature does not match the token.
    #[error("forged token: {token_id}")]
    ForgedToken {
        /// Token with a bad signature.
        token_id: TokenId,
    },

    /// No coordinator is elected and the bounded retry window elapsed.
    #[error("no coordinator elected")]
    NoCoordinator,

    /// A referenced snapshot does not exist.
    #[error("unknown snapshot: {message}")]
    UnknownSnapshot {
        /// Description of the missing snapshot.
        message: String,
    },

    /// A ledger or snapshot write failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// A record could not be serialized or parsed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl EngineError {
    /// True for transient peer errors that the federation loops retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PeerTimeout { .. } | Self::PeerUnreachable { .. })
    }

    /// True for authorization failures, which are never retried.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            Self::UnknownToken { .. }
                | Self::ExpiredToken { .. }
                | Self::ReplayedToken { .. }
                | Self::ForgedToken { .. }
        )
    }

    /// True for integrity violations that require reconciliation.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChainMismatch { .. }
                | Self::DigestMismatch { .. }
                | Self::DriftViolation { .. }
                | Self::NeedsReconciliation { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
