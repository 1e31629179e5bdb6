//! Digest-based anti-entropy between peers
//!
//! Each sync round exchanges digest-tree summaries, diffs them to find the
//! divergent partitions, and moves only those. Direction is decided by
//! causal clock: the behind side pulls, the ahead side pushes, and for
//! concurrent updates the node with the lower id is authoritative, so both
//! sides of an exchange reach the same verdict without negotiation.
//!
//! A partition whose digest still mismatches after the retry budget is
//! marked degraded; the owning structure refuses writes until reconciled.

use causeway_core::{
    Causality, ClockView, DigestSummary, DigestTree, EngineError, Hash32, NodeId, PartitionName,
    Result, SharedClock,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consecutive failed rounds before a partition is marked degraded.
const MAX_SYNC_RETRIES: u32 = 3;

/// Seam between the sync layer and a partition's owning structure.
///
/// The ledger, token service, and metering log each implement this to
/// serve their records and to fold in a peer's authoritative copy.
pub trait PartitionMerge: Send + Sync {
    /// Serialize every record of the partition for a push.
    fn export_records(&self) -> Result<Vec<serde_json::Value>>;

    /// Fold an authoritative record set into local state and return the
    /// partition's new leaf digest.
    fn merge_records(&self, records: &[serde_json::Value]) -> Result<Hash32>;
}

/// What one sync round decided to do with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Peer the plan applies to.
    pub peer_id: NodeId,
    /// Partitions to request from the peer.
    pub pulls: Vec<PartitionName>,
    /// Partitions to push to the peer.
    pub pushes: Vec<PartitionName>,
}

impl SyncPlan {
    /// True when the trees already agree.
    pub fn is_converged(&self) -> bool {
        self.pulls.is_empty() && self.pushes.is_empty()
    }
}

/// Counters accumulated across sync rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Rounds that found the trees already converged.
    pub converged_rounds: u64,
    /// Partitions pulled from peers.
    pub partitions_pulled: u64,
    /// Partitions pushed to peers.
    pub partitions_pushed: u64,
    /// Partitions currently degraded.
    pub degraded_partitions: usize,
}

struct SyncState {
    tree: DigestTree,
    retries: BTreeMap<PartitionName, u32>,
    degraded: BTreeSet<PartitionName>,
    outcome: SyncOutcome,
}

/// Plans and applies reconciliation rounds for one node.
pub struct SyncManager {
    node_id: NodeId,
    clock: SharedClock,
    handlers: BTreeMap<PartitionName, Arc<dyn PartitionMerge>>,
    state: Mutex<SyncState>,
}

impl SyncManager {
    /// Create a manager with an empty digest tree.
    pub fn new(node_id: NodeId, clock: SharedClock) -> Self {
        Self {
            node_id,
            clock,
            handlers: BTreeMap::new(),
            state: Mutex::new(SyncState {
                tree: DigestTree::new(),
                retries: BTreeMap::new(),
                degraded: BTreeSet::new(),
                outcome: SyncOutcome::default(),
            }),
        }
    }

    /// Register the owning structure for a partition.
    pub fn register(&mut self, partition: PartitionName, handler: Arc<dyn PartitionMerge>) {
        self.handlers.insert(partition, handler);
    }

    /// Record a local update to a partition's leaf digest.
    pub fn record_local_update(&self, partition: PartitionName, digest: Hash32) {
        self.state.lock().tree.update_partition(partition, digest);
    }

    /// Current digest-tree summary for an exchange.
    pub fn summary(&self) -> DigestSummary {
        self.state.lock().tree.summary()
    }

    /// Current root digest.
    pub fn root(&self) -> Hash32 {
        self.state.lock().tree.root()
    }

    /// Decide what to move after receiving a peer's summary.
    ///
    /// `local_clock` and `peer_clock` are the views each side held before
    /// the exchange message itself was merged; using the post-merge view
    /// would make the requester look causally later on every round. Both
    /// sides compute mirrored plans from the same inputs, so a partition
    /// is pulled on exactly one side and pushed on the other.
    pub fn plan(
        &self,
        peer_id: &NodeId,
        local_clock: &ClockView,
        peer_summary: &DigestSummary,
        peer_clock: &ClockView,
    ) -> SyncPlan {
        let mut state = self.state.lock();
        let divergent = state.tree.diff(peer_summary);

        if divergent.is_empty() {
            state.outcome.converged_rounds += 1;
            return SyncPlan {
                peer_id: peer_id.clone(),
                pulls: Vec::new(),
                pushes: Vec::new(),
            };
        }

        let authoritative_here = match local_clock.compare(peer_clock) {
            Causality::After => true,
            Causality::Before => false,
            // Concurrent updates: the lower node id is authoritative.
            Causality::Concurrent => self.node_id < *peer_id,
        };
        debug!(
            peer = %peer_id,
            divergent = divergent.len(),
            authoritative = authoritative_here,
            "planned sync round"
        );

        if authoritative_here {
            SyncPlan {
                peer_id: peer_id.clone(),
                pulls: Vec::new(),
                pushes: divergent,
            }
        } else {
            SyncPlan {
                peer_id: peer_id.clone(),
                pulls: divergent,
                pushes: Vec::new(),
            }
        }
    }

    /// Serve a pull: export the partition's records for the peer.
    pub fn export(&self, partition: &PartitionName) -> Result<Vec<serde_json::Value>> {
        let handler = self
            .handlers
            .get(partition)
            .ok_or_else(|| EngineError::DigestMismatch {
                partition: partition.clone(),
            })?;
        let records = handler.export_records()?;
        self.state.lock().outcome.partitions_pushed += 1;
        Ok(records)
    }

    /// Apply a pushed authoritative record set.
    ///
    /// The sender's clock merges first so the merged records are causally
    /// later than everything the sender had seen.
    pub fn apply_push(
        &self,
        partition: &PartitionName,
        records: &[serde_json::Value],
        peer_clock: &ClockView,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get(partition)
            .ok_or_else(|| EngineError::DigestMismatch {
                partition: partition.clone(),
            })?;
        self.clock.lock().merge(peer_clock);
        let new_digest = handler.merge_records(records)?;

        let mut state = self.state.lock();
        state.tree.update_partition(partition.clone(), new_digest);
        state.retries.remove(partition);
        if state.degraded.remove(partition) {
            info!(partition = %partition, "partition reconciled");
        }
        state.outcome.partitions_pulled += 1;
        state.outcome.degraded_partitions = state.degraded.len();
        Ok(())
    }

    /// Record a round that left the partition still divergent.
    ///
    /// Exhausting the retry budget marks the partition degraded and
    /// surfaces a digest mismatch.
    pub fn round_failed(&self, partition: &PartitionName) -> Result<()> {
        let mut state = self.state.lock();
        let attempts = state.retries.entry(partition.clone()).or_insert(0);
        *attempts += 1;
        if *attempts < MAX_SYNC_RETRIES {
            return Ok(());
        }
        warn!(partition = %partition, "sync retries exhausted, partition degraded");
        state.degraded.insert(partition.clone());
        state.outcome.degraded_partitions = state.degraded.len();
        Err(EngineError::DigestMismatch {
            partition: partition.clone(),
        })
    }

    /// True when the partition is degraded pending reconciliation.
    pub fn is_degraded(&self, partition: &PartitionName) -> bool {
        self.state.lock().degraded.contains(partition)
    }

    /// Accumulated counters.
    pub fn outcome(&self) -> SyncOutcome {
        self.state.lock().outcome
    }
}
