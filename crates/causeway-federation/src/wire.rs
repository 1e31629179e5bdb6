//! Federation wire format
//!
//! Logical message schema only; the transport is a seam (see
//! [`crate::node::PeerTransport`]). Every message carries the sender's
//! causal clock view so every receiver can merge it, and every envelope
//! carries a schema version so mixed-version federations can refuse
//! payloads they do not understand.

use causeway_core::{ClockView, DigestSummary, NodeId, PartitionName};
use serde::{Deserialize, Serialize};

/// Current wire schema version.
pub const WIRE_SCHEMA_VERSION: u16 = 1;

/// A peer-to-peer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Liveness signal; coordinators set `coordinator` so followers track
    /// the current leadership.
    Heartbeat {
        /// Sending node.
        node_id: NodeId,
        /// Sender's current election term.
        term: u64,
        /// Sender's causal clock view.
        clock: ClockView,
        /// Whether the sender believes it is the coordinator.
        coordinator: bool,
        /// Peers the sender knows, advertised for transitive discovery.
        known_peers: Vec<(NodeId, String)>,
    },
    /// Request for a vote in the given term.
    VoteRequest {
        /// Campaigning node.
        candidate_id: NodeId,
        /// Term the candidate is campaigning in.
        term: u64,
        /// Candidate's causal clock view.
        clock: ClockView,
    },
    /// Response to a vote request.
    VoteGrant {
        /// Voting node.
        node_id: NodeId,
        /// Term the vote applies to.
        term: u64,
        /// Whether the vote was granted.
        granted: bool,
    },
    /// Digest-tree summary for reconciliation.
    DigestExchange {
        /// Sending node.
        node_id: NodeId,
        /// Sender's digest tree summary.
        summary: DigestSummary,
        /// Sender's causal clock view.
        clock: ClockView,
    },
    /// Request for the authoritative copy of one partition.
    PartitionPull {
        /// Partition being requested.
        partition: PartitionName,
        /// Requester's clock view at request time.
        since: ClockView,
    },
    /// Authoritative records for one partition.
    PartitionPush {
        /// Partition being pushed.
        partition: PartitionName,
        /// Serialized records of the partition.
        records: Vec<serde_json::Value>,
        /// Sender's causal clock view.
        clock: ClockView,
    },
    /// Graceful departure announcement; receivers retire the sender
    /// immediately instead of waiting out the health timeouts.
    Departure {
        /// Departing node.
        node_id: NodeId,
        /// Sender's causal clock view.
        clock: ClockView,
    },
}

impl PeerMessage {
    /// The sender's clock view, if the message carries one.
    pub fn clock(&self) -> Option<&ClockView> {
        match self {
            Self::Heartbeat { clock, .. }
            | Self::VoteRequest { clock, .. }
            | Self::DigestExchange { clock, .. }
            | Self::PartitionPush { clock, .. }
            | Self::Departure { clock, .. } => Some(clock),
            Self::PartitionPull { since, .. } => Some(since),
            Self::VoteGrant { .. } => None,
        }
    }
}

/// Versioned envelope around a peer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Schema version of the payload.
    pub schema_version: u16,
    /// The message itself.
    pub message: PeerMessage,
}

impl WireEnvelope {
    /// Wrap a message in the current schema version.
    pub fn new(message: PeerMessage) -> Self {
        Self {
            schema_version: WIRE_SCHEMA_VERSION,
            message,
        }
    }

    /// True when this envelope's schema is one we can interpret.
    pub fn is_supported(&self) -> bool {
        self.schema_version == WIRE_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{hash, DigestTree};

    #[test]
    fn envelope_round_trips_through_json() {
        let mut tree = DigestTree::new();
        tree.update_partition(PartitionName::new("decisions"), hash(b"x"));
        let envelope = WireEnvelope::new(PeerMessage::DigestExchange {
            node_id: NodeId::new("n1"),
            summary: tree.summary(),
            clock: ClockView::new(),
        });

        let json = serde_json::to_string(&envelope).unwrap();
        let back: WireEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
        assert!(back.is_supported());
    }

    #[test]
    fn every_request_message_carries_a_clock() {
        let heartbeat = PeerMessage::Heartbeat {
            node_id: NodeId::new("n1"),
            term: 1,
            clock: ClockView::new(),
            coordinator: false,
            known_peers: Vec::new(),
        };
        assert!(heartbeat.clock().is_some());

        let grant = PeerMessage::VoteGrant {
            node_id: NodeId::new("n1"),
            term: 1,
            granted: true,
        };
        assert!(grant.clock().is_none());
    }
}
