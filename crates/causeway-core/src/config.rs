//! Engine configuration
//!
//! All timing knobs are constructor parameters carried by [`EngineConfig`];
//! the engine never reads ambient global state. The CLI surface that exposes
//! these as named options lives outside this workspace.

use crate::identifiers::NodeId;

/// Default lifetime of an authorization token.
pub const DEFAULT_TOKEN_TTL_MS: u64 = 30_000;

/// Default interval between heartbeats to peers.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default window after which a silent peer becomes suspect.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Default number of consecutive missed windows before a suspect peer is
/// marked unreachable.
pub const DEFAULT_SUSPECT_WINDOWS: u32 = 3;

/// Default lower bound of the randomized election timeout.
pub const DEFAULT_ELECTION_TIMEOUT_MIN_MS: u64 = 150;

/// Default upper bound of the randomized election timeout.
pub const DEFAULT_ELECTION_TIMEOUT_MAX_MS: u64 = 300;

/// Default interval between reconciliation rounds.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;

/// Default window a routed request may wait for a coordinator before a
/// no-coordinator error surfaces.
pub const DEFAULT_ROUTE_RETRY_WINDOW_MS: u64 = 3_000;

/// Default base delay for election retry backoff.
pub const DEFAULT_ELECTION_BACKOFF_BASE_MS: u64 = 50;

/// Default cap for election retry backoff.
pub const DEFAULT_ELECTION_BACKOFF_MAX_MS: u64 = 5_000;

/// Configuration for one federation node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stable identity of this node.
    pub node_id: NodeId,
    /// Lifetime of issued authorization tokens, exclusive of the boundary
    /// instant: a token presented at exactly `issued_at + ttl` is expired.
    pub token_ttl_ms: u64,
    /// Interval between heartbeats to peers.
    pub heartbeat_interval_ms: u64,
    /// Window after which a silent peer becomes suspect.
    pub heartbeat_timeout_ms: u64,
    /// Consecutive missed windows before suspect becomes unreachable.
    pub suspect_windows: u32,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Interval between reconciliation rounds.
    pub sync_interval_ms: u64,
    /// How long a routed request may wait for a coordinator.
    pub route_retry_window_ms: u64,
    /// Base delay for election retry backoff.
    pub election_backoff_base_ms: u64,
    /// Cap for election retry backoff.
    pub election_backoff_max_ms: u64,
}

impl EngineConfig {
    /// Config with default timings for the given node identity.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            token_ttl_ms: DEFAULT_TOKEN_TTL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            suspect_windows: DEFAULT_SUSPECT_WINDOWS,
            election_timeout_min_ms: DEFAULT_ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: DEFAULT_ELECTION_TIMEOUT_MAX_MS,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            route_retry_window_ms: DEFAULT_ROUTE_RETRY_WINDOW_MS,
            election_backoff_base_ms: DEFAULT_ELECTION_BACKOFF_BASE_MS,
            election_backoff_max_ms: DEFAULT_ELECTION_BACKOFF_MAX_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = EngineConfig::new(NodeId::new("n1"));
        assert_eq!(config.token_ttl_ms, DEFAULT_TOKEN_TTL_MS);
        assert!(config.election_timeout_min_ms < config.election_timeout_max_ms);
    }
}
