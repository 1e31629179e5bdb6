//! Immutable context snapshots and drift verification
//!
//! A snapshot captures the digests of every tracked subsystem at decision
//! time, rolled up into one overall digest and stamped with the causal
//! clock. Decisions reference snapshots by id; the records themselves are
//! never mutated, and this component never deletes one (retention is an
//! external policy).
//!
//! After a gated call completes, [`SnapshotManager::verify_integrity`]
//! recomputes the expected after-state from the before snapshot plus the
//! call's declared effects. Any unexplained change is reported as a drift
//! violation, never silently corrected.

use crate::store::SnapshotStore;
use causeway_core::{
    hash::Hasher, ClockView, EngineError, Hash32, Result, SharedClock, SnapshotId, TimeSource,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Immutable record of local world-state at a point in causal time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Identity of this snapshot.
    pub snapshot_id: SnapshotId,
    /// Causal clock view at snapshot time.
    pub clock: ClockView,
    /// Digest per tracked subsystem, in deterministic name order.
    pub component_digests: BTreeMap<String, Hash32>,
    /// Digest over the ordered component digests.
    pub overall_digest: Hash32,
    /// Wall-clock creation time (milliseconds since epoch, audit only).
    pub created_at_ms: u64,
}

/// One declared effect of a gated call: the digest `component` is expected
/// to have after the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredEffect {
    /// Subsystem the call intends to change.
    pub component: String,
    /// Expected digest of that subsystem afterwards.
    pub new_digest: Hash32,
}

fn overall_digest(components: &BTreeMap<String, Hash32>) -> Hash32 {
    let mut h = Hasher::new();
    for (name, digest) in components {
        h.update(name.as_bytes());
        h.update(b"=");
        h.update(digest.as_bytes());
        h.update(b";");
    }
    h.finalize()
}

/// Builds, persists, and verifies context snapshots.
pub struct SnapshotManager {
    store: SnapshotStore,
    clock: SharedClock,
    time: Arc<dyn TimeSource>,
    index: Mutex<BTreeMap<SnapshotId, ContextSnapshot>>,
}

impl SnapshotManager {
    /// Create a manager over the given store, clock, and time source.
    pub fn new(store: SnapshotStore, clock: SharedClock, time: Arc<dyn TimeSource>) -> Self {
        Self {
            store,
            clock,
            time,
            index: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build and persist a snapshot of the given component digests.
    pub fn take_snapshot(
        &self,
        components: &BTreeMap<String, Hash32>,
    ) -> Result<ContextSnapshot> {
        let snapshot = ContextSnapshot {
            snapshot_id: SnapshotId::new(),
            clock: self.clock.lock().view(),
            component_digests: components.clone(),
            overall_digest: overall_digest(components),
            created_at_ms: self.time.now_millis(),
        };
        self.store.write(&snapshot.snapshot_id, &snapshot)?;
        self.index
            .lock()
            .insert(snapshot.snapshot_id, snapshot.clone());
        Ok(snapshot)
    }

    /// Fetch a snapshot by id, falling back to the store.
    pub fn get(&self, id: &SnapshotId) -> Result<ContextSnapshot> {
        if let Some(snapshot) = self.index.lock().get(id) {
            return Ok(snapshot.clone());
        }
        self.store
            .read(id)?
            .ok_or_else(|| EngineError::UnknownSnapshot {
                message: id.to_string(),
            })
    }

    /// Check the after snapshot against the before snapshot plus the call's
    /// declared effects.
    ///
    /// Every component must either match its before digest or match the
    /// digest declared for it. The first unexplained component is reported
    /// as a drift violation.
    pub fn verify_integrity(
        &self,
        before_id: &SnapshotId,
        after_id: &SnapshotId,
        declared_effects: &[DeclaredEffect],
    ) -> Result<()> {
        let before = self.get(before_id)?;
        let after = self.get(after_id)?;

        let mut expected = before.component_digests.clone();
        for effect in declared_effects {
            expected.insert(effect.component.clone(), effect.new_digest);
        }

        for component in expected.keys().chain(after.component_digests.keys()) {
            let want = expected.get(component);
            let got = after.component_digests.get(component);
            if want != got {
                warn!(component = %component, "drift violation detected");
                return Err(EngineError::DriftViolation {
                    component: component.clone(),
                });
            }
        }
        Ok(())
    }
}
