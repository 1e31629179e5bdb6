//! Hash-chained, append-only decision ledger
//!
//! Every privileged decision appends one entry whose `self_hash` covers the
//! entry's immutable fields plus the previous entry's hash, so the whole
//! file forms a tamper-evident chain. The ledger supports no deletion and
//! no in-place edits: the after-snapshot attach is persisted as a separate
//! amendment line, and corrections are new decisions referencing the
//! corrected one.
//!
//! A failed chain verification flips the ledger into a degraded state that
//! refuses new decisions until the divergence is reconciled.

use crate::store::AppendLog;
use causeway_core::{
    hash, ClockView, DecisionId, EngineError, PartitionName, Result, SharedClock, SnapshotId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use tracing::{error, info};

/// One recorded decision.
///
/// `after_snapshot_id` starts out `None` and is attached exactly once when
/// the gated call completes; it sits outside the hashed payload so the
/// attach does not break the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Identity of this decision.
    pub decision_id: DecisionId,
    /// Free-text justification recorded by the caller.
    pub reasoning: String,
    /// Causal clock view at record time.
    pub clock: ClockView,
    /// Snapshot taken before the gated call.
    pub before_snapshot_id: SnapshotId,
    /// Snapshot taken after the call, attached exactly once.
    pub after_snapshot_id: Option<SnapshotId>,
    /// Caller confidence in the decision, clamped to [0.0, 1.0].
    pub confidence: f64,
    /// Decision this one corrects, if any.
    pub corrects: Option<DecisionId>,
    /// Hash of the previous entry; the chain anchor for the first entry is
    /// the all-zero digest.
    pub prev_decision_hash: causeway_core::Hash32,
    /// Hash over this entry's immutable fields and `prev_decision_hash`.
    /// Kept as the last field so the persisted line reconstructs the chain.
    pub self_hash: causeway_core::Hash32,
}

/// The hashed portion of a decision. Excludes `self_hash` (the output) and
/// `after_snapshot_id` (attached later, outside the chain).
#[derive(Serialize)]
struct DecisionPayload<'a> {
    decision_id: &'a DecisionId,
    reasoning: &'a str,
    clock: &'a ClockView,
    before_snapshot_id: &'a SnapshotId,
    confidence: f64,
    corrects: &'a Option<DecisionId>,
    prev_decision_hash: &'a causeway_core::Hash32,
}

fn compute_self_hash(decision: &Decision) -> Result<causeway_core::Hash32> {
    let payload = DecisionPayload {
        decision_id: &decision.decision_id,
        reasoning: &decision.reasoning,
        clock: &decision.clock,
        before_snapshot_id: &decision.before_snapshot_id,
        confidence: decision.confidence,
        corrects: &decision.corrects,
        prev_decision_hash: &decision.prev_decision_hash,
    };
    Ok(hash(&serde_json::to_vec(&payload)?))
}

/// The node-independent portion of a decision: everything hashed except the
/// chain linkage, which differs between nodes that absorbed the decision at
/// different positions.
#[derive(Serialize)]
struct ContentPayload<'a> {
    decision_id: &'a DecisionId,
    reasoning: &'a str,
    clock: &'a ClockView,
    before_snapshot_id: &'a SnapshotId,
    confidence: f64,
    corrects: &'a Option<DecisionId>,
}

fn compute_content_hash(decision: &Decision) -> Result<causeway_core::Hash32> {
    let payload = ContentPayload {
        decision_id: &decision.decision_id,
        reasoning: &decision.reasoning,
        clock: &decision.clock,
        before_snapshot_id: &decision.before_snapshot_id,
        confidence: decision.confidence,
        corrects: &decision.corrects,
    };
    Ok(hash(&serde_json::to_vec(&payload)?))
}

/// Amendment line persisted when an after-snapshot is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AfterSnapshotAmendment {
    decision_id: DecisionId,
    after_snapshot_id: SnapshotId,
}

/// Append-only decision ledger with hash-chain verification.
pub struct DecisionLedger {
    log: AppendLog<Decision>,
    amendments: AppendLog<AfterSnapshotAmendment>,
    clock: SharedClock,
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    entries: Vec<Decision>,
    degraded: bool,
}

impl DecisionLedger {
    /// Partition name under which the ledger appears in the digest tree.
    pub const PARTITION: &'static str = "decisions";

    /// Open the ledger files under `dir` and fold existing records.
    pub fn open(dir: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let dir = dir.as_ref();
        let log = AppendLog::open(dir.join("decisions.ndjson"))?;
        let amendments: AppendLog<AfterSnapshotAmendment> =
            AppendLog::open(dir.join("decision_amendments.ndjson"))?;

        let mut entries: Vec<Decision> = log.load()?;
        for amendment in amendments.load()? {
            if let Some(entry) = entries
                .iter_mut()
                .find(|d| d.decision_id == amendment.decision_id)
            {
                entry.after_snapshot_id = Some(amendment.after_snapshot_id);
            }
        }

        Ok(Self {
            log,
            amendments,
            clock,
            inner: Mutex::new(LedgerInner {
                entries,
                degraded: false,
            }),
        })
    }

    /// Append a new decision and return its id.
    ///
    /// The causal clock ticks, the new entry chains from the current tail,
    /// and the file write completes before the in-memory tail advances.
    /// Refused while the ledger is degraded.
    pub fn record(
        &self,
        reasoning: impl Into<String>,
        confidence: f64,
        before_snapshot_id: SnapshotId,
    ) -> Result<DecisionId> {
        self.record_inner(reasoning.into(), confidence, before_snapshot_id, None)
    }

    /// Append a correction referencing an earlier decision.
    pub fn record_correction(
        &self,
        corrects: DecisionId,
        reasoning: impl Into<String>,
        confidence: f64,
        before_snapshot_id: SnapshotId,
    ) -> Result<DecisionId> {
        self.record_inner(
            reasoning.into(),
            confidence,
            before_snapshot_id,
            Some(corrects),
        )
    }

    fn record_inner(
        &self,
        reasoning: String,
        confidence: f64,
        before_snapshot_id: SnapshotId,
        corrects: Option<DecisionId>,
    ) -> Result<DecisionId> {
        let mut inner = self.inner.lock();
        if inner.degraded {
            return Err(EngineError::NeedsReconciliation {
                partition: PartitionName::new(Self::PARTITION),
            });
        }

        let clock_view = {
            let mut clock = self.clock.lock();
            clock.tick();
            clock.view()
        };
        let prev_decision_hash = inner
            .entries
            .last()
            .map(|d| d.self_hash)
            .unwrap_or(causeway_core::Hash32::ZERO);

        let mut decision = Decision {
            decision_id: DecisionId::new(),
            reasoning,
            clock: clock_view,
            before_snapshot_id,
            after_snapshot_id: None,
            confidence: confidence.clamp(0.0, 1.0),
            corrects,
            prev_decision_hash,
            self_hash: causeway_core::Hash32::ZERO,
        };
        decision.self_hash = compute_self_hash(&decision)?;

        // The audit write must land before the tail advances.
        self.log.append(&decision)?;
        let id = decision.decision_id;
        inner.entries.push(decision);
        info!(decision_id = %id, "decision recorded");
        Ok(id)
    }

    /// Attach the after snapshot to a decision, exactly once.
    pub fn attach_after_snapshot(
        &self,
        decision_id: DecisionId,
        after_snapshot_id: SnapshotId,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|d| d.decision_id == decision_id)
            .ok_or(EngineError::UnknownDecision { decision_id })?;
        if entry.after_snapshot_id.is_some() {
            return Err(EngineError::AfterSnapshotAlreadyAttached { decision_id });
        }
        self.amendments.append(&AfterSnapshotAmendment {
            decision_id,
            after_snapshot_id,
        })?;
        entry.after_snapshot_id = Some(after_snapshot_id);
        Ok(())
    }

    /// Fetch a decision by id.
    pub fn get(&self, decision_id: &DecisionId) -> Result<Decision> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|d| d.decision_id == *decision_id)
            .cloned()
            .ok_or(EngineError::UnknownDecision {
                decision_id: *decision_id,
            })
    }

    /// Number of recorded decisions.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when no decisions have been recorded.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// All decisions, in append order.
    pub fn entries(&self) -> Vec<Decision> {
        self.inner.lock().entries.clone()
    }

    /// Digest over the current chain tail, for the digest tree leaf.
    pub fn tail_digest(&self) -> causeway_core::Hash32 {
        self.inner
            .lock()
            .entries
            .last()
            .map(|d| d.self_hash)
            .unwrap_or(causeway_core::Hash32::ZERO)
    }

    /// Order-independent digest over the set of held decisions.
    ///
    /// Chain hashes differ between nodes that absorbed the same decisions
    /// in different orders, so reconciliation compares this digest instead:
    /// two ledgers holding the same decision set agree on it regardless of
    /// their local chain order.
    pub fn content_digest(&self) -> Result<causeway_core::Hash32> {
        let inner = self.inner.lock();
        let mut content_hashes = Vec::with_capacity(inner.entries.len());
        for entry in &inner.entries {
            content_hashes.push(compute_content_hash(entry)?);
        }
        drop(inner);
        content_hashes.sort_unstable();
        let mut hasher = causeway_core::hash::Hasher::new();
        for digest in &content_hashes {
            hasher.update(digest.as_bytes());
        }
        Ok(hasher.finalize())
    }

    /// Absorb a decision recorded on another node.
    ///
    /// Returns false if the decision is already held. Otherwise the entry
    /// is re-chained onto the local tail (its clock, reasoning, and id are
    /// kept; only the chain linkage is local) and appended. Absorption is
    /// permitted while degraded, since it is how reconciliation proceeds.
    pub fn absorb(&self, remote: &Decision) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .iter()
            .any(|d| d.decision_id == remote.decision_id)
        {
            return Ok(false);
        }
        let prev_decision_hash = inner
            .entries
            .last()
            .map(|d| d.self_hash)
            .unwrap_or(causeway_core::Hash32::ZERO);
        let mut decision = Decision {
            after_snapshot_id: None,
            prev_decision_hash,
            self_hash: causeway_core::Hash32::ZERO,
            ..remote.clone()
        };
        decision.self_hash = compute_self_hash(&decision)?;

        self.log.append(&decision)?;
        if let Some(after_snapshot_id) = remote.after_snapshot_id {
            self.amendments.append(&AfterSnapshotAmendment {
                decision_id: decision.decision_id,
                after_snapshot_id,
            })?;
            decision.after_snapshot_id = Some(after_snapshot_id);
        }
        info!(decision_id = %decision.decision_id, "absorbed remote decision");
        inner.entries.push(decision);
        Ok(true)
    }

    /// All decisions in the convergent total order: causal height (sum of
    /// clock components) first, decision id as the deterministic tie-break
    /// for concurrent entries. Two ledgers holding the same decision set
    /// report the same sequence, whatever their local append order.
    pub fn ordered_entries(&self) -> Vec<Decision> {
        let mut entries = self.inner.lock().entries.clone();
        entries.sort_by_key(|d| {
            let height: u64 = d.clock.0.values().sum();
            (height, d.decision_id)
        });
        entries
    }

    /// Recompute hashes over `range` and check chain linkage.
    ///
    /// Returns the first point of divergence as a chain-mismatch error and
    /// degrades the ledger: no new decisions are accepted until
    /// [`clear_degraded`](Self::clear_degraded) after reconciliation.
    pub fn verify_chain(&self, range: Range<usize>) -> Result<()> {
        let mut inner = self.inner.lock();
        let end = range.end.min(inner.entries.len());
        for index in range.start..end {
            let entry = &inner.entries[index];
            let expected_prev = if index == 0 {
                causeway_core::Hash32::ZERO
            } else {
                inner.entries[index - 1].self_hash
            };
            let recomputed = compute_self_hash(entry)?;
            if entry.prev_decision_hash != expected_prev || entry.self_hash != recomputed {
                inner.degraded = true;
                error!(index, "decision chain mismatch; ledger degraded");
                return Err(EngineError::ChainMismatch { index });
            }
        }
        Ok(())
    }

    /// True while the ledger refuses new decisions pending reconciliation.
    pub fn is_degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    /// Clear the degraded state after the chain has been reconciled.
    pub fn clear_degraded(&self) {
        self.inner.lock().degraded = false;
    }
}
