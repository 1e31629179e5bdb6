//! Federation node runtime
//!
//! Owns the discovery table, the election state machine, the sync manager,
//! and the router, and runs them as three background loops (heartbeat,
//! election, sync) over a pluggable transport. Every incoming message
//! merges the sender's causal clock before anything else, so causal order
//! is preserved no matter which loop touches the message.

use crate::consensus::{ConsensusManager, ConsensusStatus, Role};
use crate::discovery::DiscoveryManager;
use crate::routing::Router;
use crate::sync::{SyncManager, SyncOutcome};
use crate::wire::{PeerMessage, WireEnvelope};
use async_trait::async_trait;
use causeway_core::{
    EngineConfig, EngineError, Hash32, NodeId, PartitionName, Result, SharedClock, TimeSource,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport seam between nodes.
///
/// Production backs this with a network client; tests back it with an
/// in-memory registry of nodes.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Fire-and-forget delivery.
    async fn send(&self, peer: &NodeId, envelope: WireEnvelope) -> Result<()>;

    /// Request expecting a reply envelope.
    async fn request(&self, peer: &NodeId, envelope: WireEnvelope) -> Result<WireEnvelope>;
}

/// Which side of a network partition this node is on, judged from peer
/// reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// Every known peer is reachable.
    Normal,
    /// Unreachable peers exist but this side still holds a quorum.
    Majority,
    /// This side is below quorum; coordinator authority is not trusted.
    Minority,
    /// No peer is reachable at all.
    Isolated,
}

/// Composite health report for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Score in `[0.0, 1.0]`; 1.0 is a fully connected, converged node.
    pub score: f64,
    /// Partition-side classification.
    pub partition_status: PartitionStatus,
    /// Human-readable conditions currently depressing the score.
    pub warnings: Vec<String>,
}

/// Point-in-time status report for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// This node's identity.
    pub node_id: NodeId,
    /// Election state.
    pub consensus: ConsensusStatus,
    /// Peer counts as (healthy, suspect, unreachable).
    pub peer_counts: (usize, usize, usize),
    /// Composite health.
    pub health: NodeHealth,
    /// Accumulated sync counters.
    pub sync: SyncOutcome,
    /// Current digest-tree root.
    pub root: Hash32,
    /// Number of nodes the causal clock has observed.
    pub clock_entries: usize,
}

/// A running federation member.
pub struct FederationNode {
    config: EngineConfig,
    clock: SharedClock,
    time: Arc<dyn TimeSource>,
    transport: Arc<dyn PeerTransport>,
    discovery: Mutex<DiscoveryManager>,
    consensus: Mutex<ConsensusManager>,
    sync: Arc<SyncManager>,
    router: Arc<Router>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FederationNode {
    /// Assemble a node from its subsystems.
    pub fn new(
        config: EngineConfig,
        clock: SharedClock,
        sync: Arc<SyncManager>,
        transport: Arc<dyn PeerTransport>,
        time: Arc<dyn TimeSource>,
    ) -> Arc<Self> {
        let router = Arc::new(Router::new(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            discovery: Mutex::new(DiscoveryManager::new(config.clone())),
            consensus: Mutex::new(ConsensusManager::new(config.clone())),
            config,
            clock,
            time,
            transport,
            sync,
            router,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// This node's identity.
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The router for coordinator-bound requests.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Join a federation through a seed peer.
    ///
    /// The seed answers the first heartbeat with its own peer list, and
    /// discovery learns the rest of the federation transitively.
    pub async fn join(&self, seed_id: NodeId, seed_endpoint: impl Into<String>) -> Result<()> {
        let now = self.time.now_millis();
        self.discovery
            .lock()
            .add_seed(seed_id.clone(), seed_endpoint, now);
        info!(seed = %seed_id, "joining federation");
        let heartbeat = self.heartbeat_message();
        self.transport
            .send(&seed_id, WireEnvelope::new(heartbeat))
            .await
    }

    /// Leave the federation gracefully, announcing departure to every
    /// active peer and stopping the background loops.
    pub async fn leave(&self) {
        let peers = self.discovery.lock().active_peers();
        let departure = PeerMessage::Departure {
            node_id: self.config.node_id.clone(),
            clock: self.clock.lock().view(),
        };
        for peer in peers {
            if let Err(err) = self
                .transport
                .send(&peer.peer_id, WireEnvelope::new(departure.clone()))
                .await
            {
                debug!(peer = %peer.peer_id, %err, "departure announcement failed");
            }
        }
        info!("left federation");
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle one incoming envelope, returning a reply when the message
    /// warrants one.
    pub async fn handle(&self, envelope: WireEnvelope) -> Result<Option<WireEnvelope>> {
        if !envelope.is_supported() {
            return Err(EngineError::Serialization {
                message: format!("unsupported wire schema {}", envelope.schema_version),
            });
        }
        // Causal order first: merge the sender's clock before acting. The
        // pre-merge view is kept for digest exchanges so the direction
        // decision is not skewed by the exchange's own merge.
        let pre_merge_view = self.clock.lock().view();
        if let Some(view) = envelope.message.clock() {
            self.clock.lock().merge(view);
        }
        let now = self.time.now_millis();

        match envelope.message {
            PeerMessage::Heartbeat {
                node_id,
                term,
                coordinator,
                known_peers,
                ..
            } => {
                {
                    let mut discovery = self.discovery.lock();
                    let endpoint = known_peers
                        .iter()
                        .find(|(id, _)| *id == node_id)
                        .map(|(_, ep)| ep.clone())
                        .unwrap_or_default();
                    discovery.observe_heartbeat(node_id.clone(), endpoint, now);
                    discovery.learn_peers(&known_peers, now);
                }
                self.consensus.lock().on_heartbeat(&node_id, term, coordinator);
                self.publish_coordinator();
                Ok(None)
            }
            PeerMessage::VoteRequest {
                candidate_id, term, ..
            } => {
                let granted = self.consensus.lock().on_vote_request(&candidate_id, term);
                self.publish_coordinator();
                Ok(Some(WireEnvelope::new(PeerMessage::VoteGrant {
                    node_id: self.config.node_id.clone(),
                    term,
                    granted,
                })))
            }
            PeerMessage::VoteGrant {
                node_id,
                term,
                granted,
            } => {
                if granted {
                    let active = self.discovery.lock().active_peers().len();
                    self.consensus.lock().on_vote_grant(&node_id, term, active);
                    self.publish_coordinator();
                }
                Ok(None)
            }
            PeerMessage::DigestExchange {
                node_id, summary, ..
            } => {
                self.discovery.lock().note_root_digest(&node_id, summary.root);
                Ok(Some(WireEnvelope::new(PeerMessage::DigestExchange {
                    node_id: self.config.node_id.clone(),
                    summary: self.sync.summary(),
                    clock: pre_merge_view,
                })))
            }
            PeerMessage::PartitionPull { partition, .. } => {
                let records = self.sync.export(&partition)?;
                Ok(Some(WireEnvelope::new(PeerMessage::PartitionPush {
                    partition,
                    records,
                    clock: self.clock.lock().view(),
                })))
            }
            PeerMessage::PartitionPush {
                partition,
                records,
                clock,
            } => {
                self.sync.apply_push(&partition, &records, &clock)?;
                Ok(None)
            }
            PeerMessage::Departure { node_id, .. } => {
                self.discovery.lock().retire(&node_id);
                self.publish_coordinator();
                Ok(None)
            }
        }
    }

    /// One heartbeat round: advance peer health and broadcast liveness.
    ///
    /// Delivery failures are transient; the health table already accounts
    /// for silent peers, so they are only logged.
    pub async fn heartbeat_tick(&self) {
        let now = self.time.now_millis();
        let peers = {
            let mut discovery = self.discovery.lock();
            discovery.probe_tick(now);
            discovery.active_peers()
        };
        let heartbeat = self.heartbeat_message();
        for peer in peers {
            if let Err(err) = self
                .transport
                .send(&peer.peer_id, WireEnvelope::new(heartbeat.clone()))
                .await
            {
                debug!(peer = %peer.peer_id, %err, "heartbeat delivery failed");
            }
        }
    }

    /// One election round: campaign in a fresh term and collect votes.
    ///
    /// Returns the resulting role. Peers that fail to answer simply cost
    /// their vote; the majority rule tolerates them.
    pub async fn election_round(&self) -> Role {
        let peers = self.discovery.lock().active_peers();
        let term = self.consensus.lock().start_election(peers.len());
        self.publish_coordinator();
        if self.consensus.lock().role() == Role::Coordinator {
            return Role::Coordinator;
        }

        let request = PeerMessage::VoteRequest {
            candidate_id: self.config.node_id.clone(),
            term,
            clock: self.clock.lock().view(),
        };
        for peer in &peers {
            match self
                .transport
                .request(&peer.peer_id, WireEnvelope::new(request.clone()))
                .await
            {
                Ok(reply) => {
                    if let Err(err) = self.handle(reply).await {
                        debug!(peer = %peer.peer_id, %err, "vote reply rejected");
                    }
                }
                Err(err) => debug!(peer = %peer.peer_id, %err, "vote request failed"),
            }
            if self.consensus.lock().role() == Role::Coordinator {
                break;
            }
        }

        let role = {
            let mut consensus = self.consensus.lock();
            if consensus.role() == Role::Candidate {
                consensus.election_failed();
            }
            consensus.role()
        };
        self.publish_coordinator();
        role
    }

    /// One sync round: exchange summaries with every healthy peer and move
    /// the divergent partitions.
    pub async fn sync_round(&self) {
        let peers = self.discovery.lock().healthy_peers();
        for peer in peers {
            if let Err(err) = self.sync_with(&peer.peer_id).await {
                if err.is_transient() {
                    debug!(peer = %peer.peer_id, %err, "sync round skipped");
                } else {
                    warn!(peer = %peer.peer_id, %err, "sync round failed");
                }
            }
        }
    }

    async fn sync_with(&self, peer_id: &NodeId) -> Result<()> {
        let local_view = self.clock.lock().view();
        let exchange = PeerMessage::DigestExchange {
            node_id: self.config.node_id.clone(),
            summary: self.sync.summary(),
            clock: local_view.clone(),
        };
        let reply = self
            .transport
            .request(peer_id, WireEnvelope::new(exchange))
            .await?;
        // The reply carries the peer's pre-exchange view.
        let (peer_summary, peer_clock) = match reply.message {
            PeerMessage::DigestExchange { summary, clock, .. } => (summary, clock),
            other => {
                return Err(EngineError::Serialization {
                    message: format!("unexpected digest exchange reply: {other:?}"),
                })
            }
        };
        self.clock.lock().merge(&peer_clock);
        self.discovery.lock().note_root_digest(peer_id, peer_summary.root);

        let plan = self.sync.plan(peer_id, &local_view, &peer_summary, &peer_clock);
        if plan.is_converged() {
            self.discovery
                .lock()
                .note_sync_clock(peer_id, peer_clock);
            return Ok(());
        }

        for partition in &plan.pulls {
            self.pull_partition(peer_id, partition).await?;
        }
        for partition in &plan.pushes {
            self.push_partition(peer_id, partition).await?;
        }
        let settled = self.clock.lock().view();
        self.discovery.lock().note_sync_clock(peer_id, settled);
        Ok(())
    }

    async fn pull_partition(&self, peer_id: &NodeId, partition: &PartitionName) -> Result<()> {
        let pull = PeerMessage::PartitionPull {
            partition: partition.clone(),
            since: self.clock.lock().view(),
        };
        let reply = self
            .transport
            .request(peer_id, WireEnvelope::new(pull))
            .await;
        match reply {
            Ok(WireEnvelope {
                message:
                    PeerMessage::PartitionPush {
                        records, clock, ..
                    },
                ..
            }) => {
                self.sync.apply_push(partition, &records, &clock)?;
                debug!(peer = %peer_id, partition = %partition, "partition pulled");
                Ok(())
            }
            Ok(_) | Err(_) => self.sync.round_failed(partition),
        }
    }

    async fn push_partition(&self, peer_id: &NodeId, partition: &PartitionName) -> Result<()> {
        let push = PeerMessage::PartitionPush {
            partition: partition.clone(),
            records: self.sync.export(partition)?,
            clock: self.clock.lock().view(),
        };
        match self.transport.send(peer_id, WireEnvelope::new(push)).await {
            Ok(()) => {
                debug!(peer = %peer_id, partition = %partition, "partition pushed");
                Ok(())
            }
            Err(_) => self.sync.round_failed(partition),
        }
    }

    /// Classify which side of a partition this node is on.
    pub fn partition_status(&self) -> PartitionStatus {
        let (healthy, suspect, unreachable) = self.discovery.lock().health_counts();
        classify_partition(healthy, healthy + suspect + unreachable)
    }

    /// Composite health report.
    pub fn health(&self) -> NodeHealth {
        let (healthy, suspect, unreachable) = self.discovery.lock().health_counts();
        let total = healthy + suspect + unreachable;
        let partition_status = classify_partition(healthy, total);
        let sync = self.sync.outcome();
        let coordinator_known = self.consensus.lock().coordinator().is_some();

        let mut score: f64 = 1.0;
        let mut warnings = Vec::new();
        if total > 0 {
            let reachable_ratio = healthy as f64 / total as f64;
            score *= 0.5 + 0.5 * reachable_ratio;
            if unreachable > 0 {
                warnings.push(format!("{unreachable} peer(s) unreachable"));
            }
            if suspect > 0 {
                warnings.push(format!("{suspect} peer(s) suspect"));
            }
        }
        if !coordinator_known {
            score *= 0.7;
            warnings.push("no coordinator elected".to_string());
        }
        if sync.degraded_partitions > 0 {
            score *= 0.5;
            warnings.push(format!(
                "{} partition(s) degraded pending reconciliation",
                sync.degraded_partitions
            ));
        }
        if partition_status == PartitionStatus::Minority
            || partition_status == PartitionStatus::Isolated
        {
            warnings.push("below quorum".to_string());
        }

        NodeHealth {
            score,
            partition_status,
            warnings,
        }
    }

    /// Point-in-time status report.
    pub fn status(&self) -> NodeStatus {
        // health() takes the discovery and consensus locks itself, so the
        // guards must drop before it runs.
        let consensus = self.consensus.lock().status();
        let peer_counts = self.discovery.lock().health_counts();
        let health = self.health();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            consensus,
            peer_counts,
            health,
            sync: self.sync.outcome(),
            root: self.sync.root(),
            clock_entries: self.clock.lock().view().len(),
        }
    }

    /// Spawn the heartbeat, election, and sync loops.
    ///
    /// The loops stop when [`leave`](Self::leave) is called. Elections only
    /// fire while no coordinator heartbeat is arriving.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let node = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                let period = Duration::from_millis(node.config.heartbeat_interval_ms);
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => node.heartbeat_tick().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let election = {
            let node = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    let timeout = Duration::from_millis(node.consensus.lock().election_timeout_ms());
                    tokio::select! {
                        _ = tokio::time::sleep(timeout) => {
                            let needs_election = {
                                let consensus = node.consensus.lock();
                                consensus.role() == Role::Follower
                                    && consensus.coordinator().is_none()
                            };
                            if needs_election && node.election_round().await != Role::Coordinator {
                                let backoff = node.consensus.lock().backoff_ms();
                                tokio::time::sleep(Duration::from_millis(backoff)).await;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let sync = {
            let node = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                let period = Duration::from_millis(node.config.sync_interval_ms);
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => node.sync_round().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        vec![heartbeat, election, sync]
    }

    fn heartbeat_message(&self) -> PeerMessage {
        let consensus = self.consensus.lock();
        PeerMessage::Heartbeat {
            node_id: self.config.node_id.clone(),
            term: consensus.term(),
            clock: self.clock.lock().view(),
            coordinator: consensus.role() == Role::Coordinator,
            known_peers: self.discovery.lock().advertisement(),
        }
    }

    fn publish_coordinator(&self) {
        self.router
            .set_coordinator(self.consensus.lock().coordinator().cloned());
    }
}

fn classify_partition(healthy_peers: usize, total_peers: usize) -> PartitionStatus {
    if total_peers == 0 {
        return PartitionStatus::Normal;
    }
    if healthy_peers == 0 {
        return PartitionStatus::Isolated;
    }
    if healthy_peers == total_peers {
        return PartitionStatus::Normal;
    }
    // Quorum counts this node itself alongside its reachable peers.
    let cluster = total_peers + 1;
    let reachable = healthy_peers + 1;
    if reachable * 2 > cluster {
        PartitionStatus::Majority
    } else {
        PartitionStatus::Minority
    }
}
