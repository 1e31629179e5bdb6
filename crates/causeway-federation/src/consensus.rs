//! Coordinator election
//!
//! Term-based elections with one vote per node per term. Ties between
//! candidates campaigning in the same term resolve deterministically: the
//! higher (term, node id) pair wins, so two simultaneous candidacies can
//! never both reach coordinator. The same ordering resolves split
//! coordination after a partition heals; the lower-id coordinator steps
//! down on sight of the other's heartbeat.
//!
//! The state machine is message-driven and owns no clock or transport; the
//! node runtime feeds it events and sends whatever messages it returns.

use causeway_core::{EngineConfig, NodeId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Election role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Accepting heartbeats from a coordinator.
    Follower,
    /// Campaigning for coordinator in the current term.
    Candidate,
    /// Won a majority in the current term.
    Coordinator,
}

/// Snapshot of the election state for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStatus {
    /// This node's identity.
    pub node_id: NodeId,
    /// Current election term.
    pub term: u64,
    /// Current role.
    pub role: Role,
    /// Coordinator this node currently recognizes, if any.
    pub coordinator: Option<NodeId>,
    /// Votes received in the current candidacy.
    pub votes: usize,
}

/// Election state machine for one node.
pub struct ConsensusManager {
    config: EngineConfig,
    term: u64,
    role: Role,
    voted_for: Option<NodeId>,
    votes: BTreeSet<NodeId>,
    coordinator: Option<NodeId>,
    failed_elections: u32,
}

impl ConsensusManager {
    /// Start as a follower in term zero with no known coordinator.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            term: 0,
            role: Role::Follower,
            voted_for: None,
            votes: BTreeSet::new(),
            coordinator: None,
            failed_elections: 0,
        }
    }

    /// Current term.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Coordinator this node currently recognizes.
    pub fn coordinator(&self) -> Option<&NodeId> {
        self.coordinator.as_ref()
    }

    /// Begin a candidacy in a fresh term, voting for self.
    ///
    /// With no active peers the node is trivially its own majority and
    /// becomes coordinator immediately. Otherwise the caller broadcasts a
    /// vote request for the returned term.
    pub fn start_election(&mut self, active_peers: usize) -> u64 {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.config.node_id.clone());
        self.votes = BTreeSet::from([self.config.node_id.clone()]);
        self.coordinator = None;
        info!(term = self.term, "starting election");

        if self.votes.len() >= Self::majority(active_peers) {
            self.win();
        }
        self.term
    }

    /// Handle an incoming vote request. Returns whether the vote is granted.
    pub fn on_vote_request(&mut self, candidate_id: &NodeId, term: u64) -> bool {
        if term < self.term {
            return false;
        }
        if term > self.term {
            self.step_down(term);
        }

        // Same-term candidate clash: yield only to a higher node id, so
        // exactly one of two simultaneous candidacies can collect votes.
        if self.role != Role::Follower {
            if *candidate_id <= self.config.node_id {
                return false;
            }
            debug!(candidate = %candidate_id, term, "yielding candidacy");
            self.role = Role::Follower;
            self.votes.clear();
            self.voted_for = Some(candidate_id.clone());
            return true;
        }
        match &self.voted_for {
            Some(already) if already != candidate_id => false,
            _ => {
                self.voted_for = Some(candidate_id.clone());
                true
            }
        }
    }

    /// Handle a vote grant. Returns true when this grant wins the election.
    pub fn on_vote_grant(&mut self, voter: &NodeId, term: u64, active_peers: usize) -> bool {
        if self.role != Role::Candidate || term != self.term {
            return false;
        }
        self.votes.insert(voter.clone());
        if self.votes.len() >= Self::majority(active_peers) {
            self.win();
            return true;
        }
        false
    }

    /// Handle a peer heartbeat. Returns true when the heartbeat changed the
    /// recognized coordinator or demoted this node.
    pub fn on_heartbeat(&mut self, from: &NodeId, term: u64, claims_coordinator: bool) -> bool {
        if term < self.term {
            return false;
        }
        if term > self.term {
            self.step_down(term);
        }
        if !claims_coordinator {
            return false;
        }

        // Split coordination after a partition heals: both sides claim the
        // role at the same term, and the lower id steps down.
        if self.role == Role::Coordinator {
            if *from > self.config.node_id {
                warn!(other = %from, term, "split coordination, stepping down");
                self.role = Role::Follower;
                self.coordinator = Some(from.clone());
                return true;
            }
            return false;
        }

        if self.role == Role::Candidate {
            self.role = Role::Follower;
            self.votes.clear();
        }
        let changed = self.coordinator.as_ref() != Some(from);
        if changed {
            info!(coordinator = %from, term, "recognizing coordinator");
        }
        self.coordinator = Some(from.clone());
        changed
    }

    /// Record a candidacy that expired without a majority.
    pub fn election_failed(&mut self) {
        if self.role == Role::Candidate {
            self.role = Role::Follower;
            self.votes.clear();
            self.failed_elections = self.failed_elections.saturating_add(1);
        }
    }

    /// Randomized election timeout in milliseconds.
    pub fn election_timeout_ms(&self) -> u64 {
        rand::thread_rng()
            .gen_range(self.config.election_timeout_min_ms..self.config.election_timeout_max_ms)
    }

    /// Jittered exponential backoff before the next candidacy, capped.
    pub fn backoff_ms(&self) -> u64 {
        let exp = self.failed_elections.min(16);
        let base = self
            .config
            .election_backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.election_backoff_max_ms);
        rand::thread_rng().gen_range(base / 2..=base)
    }

    /// Status snapshot for reporting.
    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            node_id: self.config.node_id.clone(),
            term: self.term,
            role: self.role,
            coordinator: self.coordinator.clone(),
            votes: self.votes.len(),
        }
    }

    /// Votes required for a cluster of `active_peers + 1` nodes.
    fn majority(active_peers: usize) -> usize {
        (active_peers + 1) / 2 + 1
    }

    fn win(&mut self) {
        self.role = Role::Coordinator;
        self.coordinator = Some(self.config.node_id.clone());
        self.failed_elections = 0;
        info!(term = self.term, "won election");
    }

    fn step_down(&mut self, term: u64) {
        self.term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.votes.clear();
        self.coordinator = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> ConsensusManager {
        ConsensusManager::new(EngineConfig::new(NodeId::new(id)))
    }

    #[test]
    fn single_node_elects_itself() {
        let mut consensus = node("n1");
        consensus.start_election(0);
        assert_eq!(consensus.role(), Role::Coordinator);
        assert_eq!(consensus.coordinator(), Some(&NodeId::new("n1")));
    }

    #[test]
    fn majority_of_three_is_two() {
        let mut consensus = node("n1");
        let term = consensus.start_election(2);
        assert_eq!(consensus.role(), Role::Candidate);

        // Self vote plus one grant reaches majority in a 3-node cluster.
        assert!(consensus.on_vote_grant(&NodeId::new("n2"), term, 2));
        assert_eq!(consensus.role(), Role::Coordinator);
    }

    #[test]
    fn one_vote_per_term() {
        let mut consensus = node("n1");
        assert!(consensus.on_vote_request(&NodeId::new("n2"), 5));
        assert!(!consensus.on_vote_request(&NodeId::new("n3"), 5));
        // Re-request from the same candidate is still granted.
        assert!(consensus.on_vote_request(&NodeId::new("n2"), 5));
        // A higher term resets the vote.
        assert!(consensus.on_vote_request(&NodeId::new("n3"), 6));
    }

    #[test]
    fn stale_term_requests_are_refused() {
        let mut consensus = node("n1");
        consensus.on_heartbeat(&NodeId::new("n9"), 10, true);
        assert!(!consensus.on_vote_request(&NodeId::new("n2"), 3));
    }

    #[test]
    fn same_term_candidates_yield_to_higher_id() {
        // Both campaign in the same term; the lower id yields.
        let mut low = node("node-a");
        let mut high = node("node-b");
        let term_low = low.start_election(1);
        let term_high = high.start_election(1);
        assert_eq!(term_low, term_high);

        // Lower-id candidate grants the higher-id candidate's request.
        assert!(low.on_vote_request(&NodeId::new("node-b"), term_high));
        assert_eq!(low.role(), Role::Follower);

        // Higher-id candidate refuses the lower-id candidate's request.
        assert!(!high.on_vote_request(&NodeId::new("node-a"), term_low));

        assert!(high.on_vote_grant(&NodeId::new("node-a"), term_high, 1));
        assert_eq!(high.role(), Role::Coordinator);
    }

    #[test]
    fn split_coordination_resolves_to_higher_id() {
        let mut low = node("node-a");
        let mut high = node("node-b");
        low.start_election(0);
        high.start_election(0);
        assert_eq!(low.role(), Role::Coordinator);
        assert_eq!(high.role(), Role::Coordinator);

        // Partition heals; each sees the other's coordinator heartbeat.
        let term = low.term().max(high.term());
        assert!(low.on_heartbeat(&NodeId::new("node-b"), term, true));
        assert!(!high.on_heartbeat(&NodeId::new("node-a"), term, true));

        assert_eq!(low.role(), Role::Follower);
        assert_eq!(low.coordinator(), Some(&NodeId::new("node-b")));
        assert_eq!(high.role(), Role::Coordinator);
    }

    #[test]
    fn higher_term_heartbeat_demotes_coordinator() {
        let mut consensus = node("n1");
        consensus.start_election(0);
        assert_eq!(consensus.role(), Role::Coordinator);

        assert!(consensus.on_heartbeat(&NodeId::new("n0"), consensus.term() + 1, true));
        assert_eq!(consensus.role(), Role::Follower);
        assert_eq!(consensus.coordinator(), Some(&NodeId::new("n0")));
    }

    #[test]
    fn failed_elections_grow_backoff() {
        let mut consensus = node("n1");
        consensus.start_election(4);
        consensus.election_failed();
        consensus.start_election(4);
        consensus.election_failed();
        let backoff = consensus.backoff_ms();
        assert!(backoff <= consensus.config.election_backoff_max_ms);
        assert!(backoff >= consensus.config.election_backoff_base_ms);
    }

    #[test]
    fn timeout_is_within_configured_bounds() {
        let consensus = node("n1");
        for _ in 0..64 {
            let t = consensus.election_timeout_ms();
            assert!(t >= consensus.config.election_timeout_min_ms);
            assert!(t < consensus.config.election_timeout_max_ms);
        }
    }
}
