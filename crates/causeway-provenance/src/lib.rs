//! # Causeway Provenance - Decision Records and Authorization
//!
//! Every privileged action a node takes is anchored to a verifiable decision
//! record:
//!
//! 1. an immutable context snapshot captures the world-state before the call
//! 2. a hash-chained decision entry is appended to the decision ledger
//! 3. a short-lived, single-use token is issued against that decision
//! 4. the call runs only after the token validates and is consumed, which
//!    also writes a metering entry
//! 5. an after snapshot closes the decision out and is checked against the
//!    declared effects; any unexplained change is a drift violation
//!
//! All ledgers persist as append-only newline-delimited JSON. The token
//! ledger stores lifecycle events (issued/consumed/expired) and folds them
//! into current state on load, so the file never rewrites a record.

/// Append-only NDJSON logs and the one-file-per-snapshot store
pub mod store;

/// Immutable context snapshots and drift verification
pub mod snapshot;

/// Hash-chained, append-only decision ledger
pub mod decision;

/// Short-lived, single-use authorization tokens
pub mod token;

/// Append-only metering ledger with aggregate queries
pub mod metering;

/// Tool-invocation boundary: approve, authorize, close out
pub mod gate;

pub use decision::{Decision, DecisionLedger};
pub use gate::{DecisionGate, GateOutcome, GateRequest, StateProbe};
pub use metering::{MeteringEntry, MeteringLedger, MeteringSummary};
pub use snapshot::{ContextSnapshot, DeclaredEffect, SnapshotManager};
pub use store::{AppendLog, SnapshotStore};
pub use token::{AuthToken, TokenService, TokenStatus};
