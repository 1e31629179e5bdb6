//! Decision-ledger replication over the sync layer
//!
//! The decision ledger is the one partition where the authoritative copy
//! must not replace local state wholesale: every node's decisions survive a
//! merge. [`DecisionLedgerReplica`] adapts the ledger to the sync seam by
//! exporting full decision lines and absorbing unseen remote decisions,
//! re-chained onto the local tail. The leaf digest is the ledger's
//! order-independent content digest, so two nodes holding the same decision
//! set converge even though their local chain orders differ.

use crate::sync::PartitionMerge;
use causeway_core::{Hash32, PartitionName, Result};
use causeway_provenance::{Decision, DecisionLedger};
use std::sync::Arc;
use tracing::debug;

/// Sync-layer view of a node's decision ledger.
pub struct DecisionLedgerReplica {
    ledger: Arc<DecisionLedger>,
}

impl DecisionLedgerReplica {
    /// Wrap a ledger for registration with the sync manager.
    pub fn new(ledger: Arc<DecisionLedger>) -> Arc<Self> {
        Arc::new(Self { ledger })
    }

    /// Partition name the replica registers under.
    pub fn partition() -> PartitionName {
        PartitionName::new(DecisionLedger::PARTITION)
    }
}

impl PartitionMerge for DecisionLedgerReplica {
    fn export_records(&self) -> Result<Vec<serde_json::Value>> {
        self.ledger
            .entries()
            .iter()
            .map(|decision| serde_json::to_value(decision).map_err(Into::into))
            .collect()
    }

    fn merge_records(&self, records: &[serde_json::Value]) -> Result<Hash32> {
        let mut absorbed = 0usize;
        for record in records {
            let decision: Decision = serde_json::from_value(record.clone())?;
            if self.ledger.absorb(&decision)? {
                absorbed += 1;
            }
        }
        if absorbed > 0 {
            debug!(absorbed, "merged remote decisions");
            // The merge is the reconciliation a degraded ledger waits for.
            self.ledger.clear_degraded();
        }
        self.ledger.content_digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{shared_clock, CausalClock, NodeId, SnapshotId};

    fn ledger(id: &str, dir: &std::path::Path) -> Arc<DecisionLedger> {
        Arc::new(
            DecisionLedger::open(dir, shared_clock(CausalClock::new(NodeId::new(id)))).unwrap(),
        )
    }

    #[test]
    fn merge_absorbs_unseen_decisions_only() {
        let dir_x = tempfile::tempdir().unwrap();
        let dir_y = tempfile::tempdir().unwrap();
        let x = ledger("x", dir_x.path());
        let y = ledger("y", dir_y.path());
        x.record("from x", 1.0, SnapshotId::new()).unwrap();
        y.record("from y", 1.0, SnapshotId::new()).unwrap();

        let replica_x = DecisionLedgerReplica::new(x.clone());
        let replica_y = DecisionLedgerReplica::new(y.clone());

        let exported = replica_x.export_records().unwrap();
        replica_y.merge_records(&exported).unwrap();
        assert_eq!(y.len(), 2);

        // Applying the same export again changes nothing.
        let digest = replica_y.merge_records(&exported).unwrap();
        assert_eq!(y.len(), 2);
        assert_eq!(digest, y.content_digest().unwrap());
    }

    #[test]
    fn merged_replicas_report_equal_digests() {
        let dir_x = tempfile::tempdir().unwrap();
        let dir_y = tempfile::tempdir().unwrap();
        let x = ledger("x", dir_x.path());
        let y = ledger("y", dir_y.path());
        x.record("d1", 1.0, SnapshotId::new()).unwrap();
        y.record("d2", 1.0, SnapshotId::new()).unwrap();

        let replica_x = DecisionLedgerReplica::new(x.clone());
        let replica_y = DecisionLedgerReplica::new(y.clone());
        let digest_y = replica_y
            .merge_records(&replica_x.export_records().unwrap())
            .unwrap();
        let digest_x = replica_x
            .merge_records(&replica_y.export_records().unwrap())
            .unwrap();
        assert_eq!(digest_x, digest_y);
    }
}
