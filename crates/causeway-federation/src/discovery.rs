//! Peer discovery and health tracking
//!
//! The peer table uses a three-state health model: a peer that answers
//! within the heartbeat window is healthy, one that misses a window is
//! suspect, and one that misses several consecutive windows is unreachable.
//! Unreachable peers stay in the table so a returning peer is recognized
//! rather than treated as new; permanent retirement is a tombstone, never a
//! physical delete.
//!
//! New peers are learned transitively: any heartbeat may advertise the
//! sender's own peer list, and previously-unknown peers enter in suspect
//! state pending a direct heartbeat.

use causeway_core::{ClockView, EngineConfig, Hash32, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Reachability classification of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// Responded within the current heartbeat window.
    Healthy,
    /// Missed one heartbeat window.
    Suspect,
    /// Missed enough consecutive windows to be considered down.
    Unreachable,
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable identity of the peer.
    pub peer_id: NodeId,
    /// How to reach the peer.
    pub endpoint: String,
    /// Current health classification.
    pub health: HealthState,
    /// Last time the peer was heard from (milliseconds since epoch).
    pub last_seen_ms: u64,
    /// Consecutive heartbeat windows missed.
    pub missed_windows: u32,
    /// Root digest last reported by the peer.
    pub last_root_digest: Option<Hash32>,
    /// Clock view at the last completed sync with the peer.
    pub last_sync_clock: ClockView,
    /// Tombstone: the peer was permanently retired but kept for history.
    pub retired: bool,
}

impl PeerRecord {
    fn new(peer_id: NodeId, endpoint: String, health: HealthState, now_ms: u64) -> Self {
        Self {
            peer_id,
            endpoint,
            health,
            last_seen_ms: now_ms,
            missed_windows: 0,
            last_root_digest: None,
            last_sync_clock: ClockView::new(),
            retired: false,
        }
    }

    /// True for peers that should receive heartbeats and sync rounds.
    pub fn is_active(&self) -> bool {
        !self.retired && self.health != HealthState::Unreachable
    }
}

/// Maintains the table of known peers.
pub struct DiscoveryManager {
    config: EngineConfig,
    peers: BTreeMap<NodeId, PeerRecord>,
}

impl DiscoveryManager {
    /// Create an empty peer table for the configured node.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            peers: BTreeMap::new(),
        }
    }

    /// Add a seed peer directly (bootstrap). Enters suspect until it
    /// answers a heartbeat.
    pub fn add_seed(&mut self, peer_id: NodeId, endpoint: impl Into<String>, now_ms: u64) {
        if peer_id == self.config.node_id {
            return;
        }
        self.peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerRecord::new(peer_id, endpoint.into(), HealthState::Suspect, now_ms));
    }

    /// Record a direct heartbeat from a peer.
    pub fn observe_heartbeat(&mut self, peer_id: NodeId, endpoint: impl Into<String>, now_ms: u64) {
        if peer_id == self.config.node_id {
            return;
        }
        let record = self
            .peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerRecord::new(peer_id.clone(), String::new(), HealthState::Suspect, now_ms));
        if record.retired {
            return;
        }
        if record.health != HealthState::Healthy {
            info!(peer = %peer_id, "peer is healthy");
        }
        let endpoint = endpoint.into();
        if !endpoint.is_empty() {
            record.endpoint = endpoint;
        }
        record.health = HealthState::Healthy;
        record.last_seen_ms = now_ms;
        record.missed_windows = 0;
    }

    /// Learn peers advertised by another peer.
    ///
    /// Unknown peers are added in suspect state pending a direct
    /// heartbeat; known peers are left untouched.
    pub fn learn_peers(&mut self, advertised: &[(NodeId, String)], now_ms: u64) {
        for (peer_id, endpoint) in advertised {
            if *peer_id == self.config.node_id || self.peers.contains_key(peer_id) {
                continue;
            }
            debug!(peer = %peer_id, "learned peer transitively");
            self.peers.insert(
                peer_id.clone(),
                PeerRecord::new(peer_id.clone(), endpoint.clone(), HealthState::Suspect, now_ms),
            );
        }
    }

    /// Advance health state for every peer based on elapsed silence.
    ///
    /// Healthy peers that missed the current window become suspect;
    /// suspect peers accumulate missed windows until the configured limit
    /// marks them unreachable.
    pub fn probe_tick(&mut self, now_ms: u64) {
        let timeout = self.config.heartbeat_timeout_ms;
        let max_windows = self.config.suspect_windows;
        for record in self.peers.values_mut() {
            if record.retired || record.health == HealthState::Unreachable {
                continue;
            }
            let windows_missed = (now_ms.saturating_sub(record.last_seen_ms)) / timeout.max(1);
            if windows_missed == 0 {
                continue;
            }
            record.missed_windows = windows_missed.min(u64::from(u32::MAX)) as u32;
            if record.missed_windows >= max_windows {
                if record.health != HealthState::Unreachable {
                    warn!(peer = %record.peer_id, "peer unreachable");
                }
                record.health = HealthState::Unreachable;
            } else if record.health == HealthState::Healthy {
                warn!(peer = %record.peer_id, "peer suspect");
                record.health = HealthState::Suspect;
            }
        }
    }

    /// Record the digest root a peer last reported.
    pub fn note_root_digest(&mut self, peer_id: &NodeId, root: Hash32) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.last_root_digest = Some(root);
        }
    }

    /// Record the clock view after a completed sync with a peer.
    pub fn note_sync_clock(&mut self, peer_id: &NodeId, clock: ClockView) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.last_sync_clock = clock;
        }
    }

    /// Permanently retire a peer, keeping its record as a tombstone.
    pub fn retire(&mut self, peer_id: &NodeId) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.retired = true;
            record.health = HealthState::Unreachable;
            info!(peer = %peer_id, "peer retired");
        }
    }

    /// All peer records, including tombstones.
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Peers eligible for heartbeats, elections, and sync.
    pub fn active_peers(&self) -> Vec<PeerRecord> {
        self.peers.values().filter(|p| p.is_active()).cloned().collect()
    }

    /// Healthy peers only.
    pub fn healthy_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .values()
            .filter(|p| !p.retired && p.health == HealthState::Healthy)
            .cloned()
            .collect()
    }

    /// Advertisable (peer id, endpoint) list for heartbeats.
    pub fn advertisement(&self) -> Vec<(NodeId, String)> {
        self.peers
            .values()
            .filter(|p| !p.retired)
            .map(|p| (p.peer_id.clone(), p.endpoint.clone()))
            .collect()
    }

    /// Count of non-retired peers per health state.
    pub fn health_counts(&self) -> (usize, usize, usize) {
        let mut healthy = 0;
        let mut suspect = 0;
        let mut unreachable = 0;
        for record in self.peers.values().filter(|p| !p.retired) {
            match record.health {
                HealthState::Healthy => healthy += 1,
                HealthState::Suspect => suspect += 1,
                HealthState::Unreachable => unreachable += 1,
            }
        }
        (healthy, suspect, unreachable)
    }
}
