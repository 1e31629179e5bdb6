//! Tool-invocation boundary
//!
//! The gate is the seam between the external invocation transport and the
//! provenance engine. Before a gated action runs, the caller presents the
//! action name, its declared effects, and the requested scope; the gate
//! takes the before snapshot, records the decision, and issues the token.
//! The action may then execute exactly once against that token. Afterwards
//! the caller reports the actual component digests; the gate snapshots
//! them and checks the change against the declared effects.
//!
//! Rejections are a tagged variant carrying the full typed error, not a
//! bare failure flag, so callers keep the complete rejection taxonomy.

use crate::decision::DecisionLedger;
use crate::metering::MeteringLedger;
use crate::snapshot::{DeclaredEffect, SnapshotManager};
use crate::token::TokenService;
use causeway_core::{DecisionId, EngineError, Hash32, Result, TokenId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Supplies the current digest of every tracked subsystem.
///
/// Wired in by the node runtime; tests provide an in-memory probe.
pub trait StateProbe: Send + Sync {
    /// Current digest per subsystem name.
    fn component_digests(&self) -> BTreeMap<String, Hash32>;
}

/// What the external transport presents before a gated action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRequest {
    /// Name of the gated action.
    pub action_name: String,
    /// Effects the action declares it will have.
    pub declared_effects: Vec<DeclaredEffect>,
    /// Scope requested for the authorization token.
    pub requested_scope: String,
}

/// Outcome of a gate approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Decision recorded and token issued; the action may run once.
    Approved {
        /// The recorded decision.
        decision_id: DecisionId,
        /// The single-use token bound to it.
        token_id: TokenId,
        /// Signature the executor must present back.
        signature: String,
    },
    /// The request was refused; the typed reason is preserved.
    Rejected(EngineError),
}

struct PendingCall {
    declared_effects: Vec<DeclaredEffect>,
}

/// The decision gate wrapping every privileged call.
pub struct DecisionGate {
    probe: Arc<dyn StateProbe>,
    snapshots: Arc<SnapshotManager>,
    ledger: Arc<DecisionLedger>,
    tokens: Arc<TokenService>,
    metering: Arc<MeteringLedger>,
    pending: Mutex<HashMap<DecisionId, PendingCall>>,
}

impl DecisionGate {
    /// Assemble a gate over the provenance subsystems.
    pub fn new(
        probe: Arc<dyn StateProbe>,
        snapshots: Arc<SnapshotManager>,
        ledger: Arc<DecisionLedger>,
        tokens: Arc<TokenService>,
        metering: Arc<MeteringLedger>,
    ) -> Self {
        Self {
            probe,
            snapshots,
            ledger,
            tokens,
            metering,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Approve (or reject) a gated action before it runs.
    ///
    /// On success the decision is in the ledger, the before snapshot is
    /// persisted, and a single-use token is issued.
    pub fn begin(
        &self,
        request: GateRequest,
        reasoning: impl Into<String>,
        confidence: f64,
    ) -> GateOutcome {
        match self.begin_inner(&request, reasoning.into(), confidence) {
            Ok(outcome) => outcome,
            Err(err) => GateOutcome::Rejected(err),
        }
    }

    fn begin_inner(
        &self,
        request: &GateRequest,
        reasoning: String,
        confidence: f64,
    ) -> Result<GateOutcome> {
        let before = self.snapshots.take_snapshot(&self.probe.component_digests())?;
        let decision_id = self
            .ledger
            .record(reasoning, confidence, before.snapshot_id)?;
        let token = self.tokens.issue(decision_id, request.requested_scope.clone())?;
        self.pending.lock().insert(
            decision_id,
            PendingCall {
                declared_effects: request.declared_effects.clone(),
            },
        );
        info!(
            action = %request.action_name,
            decision_id = %decision_id,
            token_id = %token.token_id,
            "gated action approved"
        );
        Ok(GateOutcome::Approved {
            decision_id,
            token_id: token.token_id,
            signature: token.signature,
        })
    }

    /// Consume the token immediately before execution and meter the spend.
    ///
    /// Authorization failures are fatal to the call and never retried.
    pub fn authorize(
        &self,
        token_id: TokenId,
        presented_signature: &str,
        resource_type: impl Into<String>,
        units: u64,
    ) -> Result<DecisionId> {
        let (token, consumed_at_ms) = self
            .tokens
            .validate_and_consume(token_id, presented_signature)?;
        self.metering.record(
            token.token_id,
            token.decision_id,
            resource_type,
            units,
            consumed_at_ms,
        )?;
        Ok(token.decision_id)
    }

    /// Close out a decision after the action ran.
    ///
    /// Snapshots the caller-reported actual component digests, attaches the
    /// after snapshot (exactly once), and verifies the state change against
    /// the effects declared at `begin`.
    pub fn complete(
        &self,
        decision_id: DecisionId,
        actual_components: &BTreeMap<String, Hash32>,
    ) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .remove(&decision_id)
            .ok_or(EngineError::UnknownDecision { decision_id })?;

        let after = self.snapshots.take_snapshot(actual_components)?;
        self.ledger
            .attach_after_snapshot(decision_id, after.snapshot_id)?;

        let decision = self.ledger.get(&decision_id)?;
        self.snapshots.verify_integrity(
            &decision.before_snapshot_id,
            &after.snapshot_id,
            &pending.declared_effects,
        )
    }
}
