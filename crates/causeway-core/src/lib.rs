//! # Causeway Core - Foundational Types
//!
//! This crate provides the foundational types shared by the provenance and
//! federation layers:
//!
//! - Identifier newtypes for nodes, decisions, tokens, and snapshots
//! - A centralized hash module with a 32-byte digest type
//! - The causal clock used to stamp decisions and wire messages
//! - The state digest tree used for reconciliation
//! - Engine configuration and the unified error type
//!
//! Everything here is pure and synchronous; async loops and persistence live
//! in the downstream crates.

/// Identifier newtypes for nodes, decisions, tokens, snapshots, and partitions
pub mod identifiers;

/// Centralized hashing (SHA-256) and the 32-byte digest type
pub mod hash;

/// Causal clock for partial ordering of events across nodes
pub mod clock;

/// State digest tree for locating divergent partitions between nodes
pub mod digest;

/// Time source abstraction for deterministic tests
pub mod time;

/// Engine configuration with constructor-injected parameters
pub mod config;

/// Unified error type covering the full failure taxonomy
pub mod error;

pub use clock::{shared_clock, CausalClock, Causality, ClockView, SharedClock};
pub use config::EngineConfig;
pub use digest::{DigestSummary, DigestTree};
pub use error::{EngineError, Result};
pub use hash::{hash, Hash32};
pub use identifiers::{DecisionId, EntryId, NodeId, PartitionName, SnapshotId, TokenId};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
