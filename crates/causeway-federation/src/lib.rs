//! # Causeway Federation - Discovery, Consensus, Sync and Routing
//!
//! The federation layer lets independently running nodes discover each
//! other, elect a coordinator, and reconcile divergent state:
//!
//! - **Discovery** keeps a three-state health table over known peers and
//!   learns new peers transitively from peer advertisements
//! - **Consensus** runs term-based elections with a deterministic
//!   (term, node id) tie-break and detects split coordination
//! - **Sync** exchanges digest-tree summaries and pulls or pushes only the
//!   divergent partitions, deciding direction by causal clock with a
//!   node-id tie-break for concurrent updates
//! - **Routing** forwards partition-owning requests to the coordinator and
//!   queues with a bounded window while no coordinator is elected
//!
//! The node runtime wires these together behind a transport seam and runs
//! them as independent tokio tasks.

/// Versioned wire messages exchanged between peers
pub mod wire;

/// Peer table with three-state health tracking
pub mod discovery;

/// Coordinator election state machine
pub mod consensus;

/// Digest-based state reconciliation
pub mod sync;

/// Decision-ledger replication over the sync layer
pub mod ledger;

/// Request routing toward the coordinator
pub mod routing;

/// Node runtime owning the background loops
pub mod node;

pub use consensus::{ConsensusManager, ConsensusStatus, Role};
pub use discovery::{DiscoveryManager, HealthState, PeerRecord};
pub use ledger::DecisionLedgerReplica;
pub use node::{FederationNode, NodeHealth, NodeStatus, PartitionStatus, PeerTransport};
pub use routing::{RouteDecision, Router};
pub use sync::{PartitionMerge, SyncManager, SyncOutcome, SyncPlan};
pub use wire::{PeerMessage, WireEnvelope, WIRE_SCHEMA_VERSION};
