//! Multi-node scenarios over an in-memory transport.

use async_trait::async_trait;
use causeway_core::{
    hash, shared_clock, CausalClock, EngineConfig, EngineError, Hash32, NodeId, PartitionName,
    Result,
};
use causeway_federation::{
    DecisionLedgerReplica, FederationNode, PartitionMerge, PeerTransport, Role, RouteDecision,
    SyncManager, WireEnvelope,
};
use causeway_provenance::DecisionLedger;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Delivers envelopes by invoking the target node's handler directly.
#[derive(Default)]
struct MeshTransport {
    nodes: Mutex<HashMap<NodeId, Arc<FederationNode>>>,
}

impl MeshTransport {
    fn register(&self, node: Arc<FederationNode>) {
        self.nodes.lock().insert(node.node_id().clone(), node);
    }

    fn target(&self, peer: &NodeId) -> Result<Arc<FederationNode>> {
        self.nodes
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| EngineError::PeerUnreachable {
                peer: peer.to_string(),
            })
    }
}

#[async_trait]
impl PeerTransport for MeshTransport {
    async fn send(&self, peer: &NodeId, envelope: WireEnvelope) -> Result<()> {
        self.target(peer)?.handle(envelope).await?;
        Ok(())
    }

    async fn request(&self, peer: &NodeId, envelope: WireEnvelope) -> Result<WireEnvelope> {
        self.target(peer)?
            .handle(envelope)
            .await?
            .ok_or_else(|| EngineError::PeerTimeout {
                peer: peer.to_string(),
            })
    }
}

/// Partition whose authoritative copy replaces local contents wholesale.
struct ReplaceHandler {
    records: Mutex<Vec<serde_json::Value>>,
}

impl ReplaceHandler {
    fn new(records: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(
                records
                    .iter()
                    .map(|s| serde_json::Value::String((*s).to_string()))
                    .collect(),
            ),
        })
    }

    fn digest(&self) -> Hash32 {
        let joined = self
            .records
            .lock()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        hash(joined.as_bytes())
    }

    fn contents(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

impl PartitionMerge for ReplaceHandler {
    fn export_records(&self) -> Result<Vec<serde_json::Value>> {
        Ok(self.records.lock().clone())
    }

    fn merge_records(&self, records: &[serde_json::Value]) -> Result<Hash32> {
        *self.records.lock() = records.to_vec();
        Ok(self.digest())
    }
}

struct TestNode {
    node: Arc<FederationNode>,
    handler: Arc<ReplaceHandler>,
    sync: Arc<SyncManager>,
    clock: causeway_core::SharedClock,
}

fn build_node(id: &str, transport: &Arc<MeshTransport>, records: &[&str]) -> TestNode {
    let node_id = NodeId::new(id);
    let clock = shared_clock(CausalClock::new(node_id.clone()));
    let handler = ReplaceHandler::new(records);

    let mut sync = SyncManager::new(node_id.clone(), clock.clone());
    sync.register(PartitionName::new("decisions"), handler.clone());
    sync.record_local_update(PartitionName::new("decisions"), handler.digest());
    let sync = Arc::new(sync);

    let node = FederationNode::new(
        EngineConfig::new(node_id),
        clock.clone(),
        sync.clone(),
        transport.clone() as Arc<dyn PeerTransport>,
        Arc::new(causeway_core::ManualTimeSource::new(0)),
    );
    transport.register(node.clone());
    TestNode {
        node,
        handler,
        sync,
        clock,
    }
}

async fn introduce(a: &TestNode, b: &TestNode) {
    a.node
        .join(b.node.node_id().clone(), "mesh")
        .await
        .unwrap();
    b.node
        .join(a.node.node_id().clone(), "mesh")
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_divergence_converges_on_lower_id_copy() {
    let transport = Arc::new(MeshTransport::default());
    let a = build_node("node-a", &transport, &["shared", "from-a"]);
    let b = build_node("node-b", &transport, &["shared", "from-b"]);
    introduce(&a, &b).await;

    // Each side records an independent local event, so the clock views are
    // incomparable and only the node-id tie-break can pick a winner.
    a.clock.lock().tick();
    b.clock.lock().tick();
    assert_ne!(a.sync.root(), b.sync.root());

    // Either side may start the round; the lower id is authoritative for
    // concurrent updates, so node-a's copy wins regardless.
    b.node.sync_round().await;
    a.node.sync_round().await;

    assert_eq!(a.sync.root(), b.sync.root());
    assert_eq!(a.handler.contents(), vec!["shared", "from-a"]);
    assert_eq!(b.handler.contents(), vec!["shared", "from-a"]);
}

#[tokio::test]
async fn causally_behind_node_catches_up() {
    let transport = Arc::new(MeshTransport::default());
    let a = build_node("node-a", &transport, &["old"]);
    let b = build_node("node-b", &transport, &["old", "newer"]);
    introduce(&a, &b).await;

    // node-a's heartbeat folds its view into node-b, so node-b's state is
    // causally after everything node-a has seen. The later clock wins even
    // against the lower-id tie-break.
    a.node.heartbeat_tick().await;
    a.node.sync_round().await;

    assert_eq!(a.handler.contents(), vec!["old", "newer"]);
    assert_eq!(a.sync.root(), b.sync.root());
}

#[tokio::test]
async fn simultaneous_candidacies_elect_exactly_one_coordinator() {
    let transport = Arc::new(MeshTransport::default());
    let a = build_node("node-a", &transport, &[]);
    let b = build_node("node-b", &transport, &[]);
    introduce(&a, &b).await;

    let _ = tokio::join!(a.node.election_round(), b.node.election_round());
    let coordinators = [a.node.status(), b.node.status()]
        .iter()
        .filter(|s| s.consensus.role == Role::Coordinator)
        .count();
    assert_eq!(coordinators, 1);

    // Heartbeats settle both nodes on the same coordinator.
    a.node.heartbeat_tick().await;
    b.node.heartbeat_tick().await;
    let seen_a = a.node.status().consensus.coordinator;
    let seen_b = b.node.status().consensus.coordinator;
    assert_eq!(seen_a, seen_b);
    assert!(seen_a.is_some());
}

#[tokio::test]
async fn followers_route_to_the_elected_coordinator() {
    let transport = Arc::new(MeshTransport::default());
    let a = build_node("node-a", &transport, &[]);
    let b = build_node("node-b", &transport, &[]);
    introduce(&a, &b).await;

    assert_eq!(a.node.election_round().await, Role::Coordinator);
    b.node.heartbeat_tick().await;
    a.node.heartbeat_tick().await;

    assert_eq!(a.node.router().route().await.unwrap(), RouteDecision::Local);
    assert_eq!(
        b.node.router().route().await.unwrap(),
        RouteDecision::Forward(NodeId::new("node-a"))
    );
}

#[tokio::test]
async fn departure_removes_peer_from_both_tables() {
    let transport = Arc::new(MeshTransport::default());
    let a = build_node("node-a", &transport, &[]);
    let b = build_node("node-b", &transport, &[]);
    introduce(&a, &b).await;
    assert_eq!(a.node.status().peer_counts.0, 1);

    b.node.leave().await;
    assert_eq!(a.node.status().peer_counts, (0, 0, 0));
}

#[tokio::test]
async fn divergent_decision_ledgers_merge_and_agree_on_order() {
    let transport = Arc::new(MeshTransport::default());
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let build = |id: &str, dir: &std::path::Path| {
        let node_id = NodeId::new(id);
        let clock = shared_clock(CausalClock::new(node_id.clone()));
        let ledger = Arc::new(DecisionLedger::open(dir, clock.clone()).unwrap());
        let replica = DecisionLedgerReplica::new(ledger.clone());

        let mut sync = SyncManager::new(node_id.clone(), clock.clone());
        sync.register(DecisionLedgerReplica::partition(), replica);
        sync.record_local_update(
            DecisionLedgerReplica::partition(),
            ledger.content_digest().unwrap(),
        );
        let sync = Arc::new(sync);

        let node = FederationNode::new(
            EngineConfig::new(node_id),
            clock,
            sync.clone(),
            transport.clone() as Arc<dyn PeerTransport>,
            Arc::new(causeway_core::ManualTimeSource::new(0)),
        );
        transport.register(node.clone());
        (node, ledger, sync)
    };

    let (node_a, ledger_a, sync_a) = build("node-a", dir_a.path());
    let (node_b, ledger_b, sync_b) = build("node-b", dir_b.path());
    node_a
        .join(node_b.node_id().clone(), "mesh")
        .await
        .unwrap();
    node_b
        .join(node_a.node_id().clone(), "mesh")
        .await
        .unwrap();

    // Each node records a decision the other has not seen.
    let d1 = ledger_a
        .record("issued on a", 0.9, causeway_core::SnapshotId::new())
        .unwrap();
    let d2 = ledger_b
        .record("issued on b", 0.8, causeway_core::SnapshotId::new())
        .unwrap();
    sync_a.record_local_update(
        DecisionLedgerReplica::partition(),
        ledger_a.content_digest().unwrap(),
    );
    sync_b.record_local_update(
        DecisionLedgerReplica::partition(),
        ledger_b.content_digest().unwrap(),
    );

    // One round moves the authoritative side; the reverse round completes
    // the union since the merge keeps local decisions.
    node_a.sync_round().await;
    node_b.sync_round().await;
    node_a.sync_round().await;

    assert!(ledger_a.get(&d1).is_ok() && ledger_a.get(&d2).is_ok());
    assert!(ledger_b.get(&d1).is_ok() && ledger_b.get(&d2).is_ok());
    assert_eq!(
        ledger_a.content_digest().unwrap(),
        ledger_b.content_digest().unwrap()
    );

    let order_a: Vec<_> = ledger_a
        .ordered_entries()
        .iter()
        .map(|d| d.decision_id)
        .collect();
    let order_b: Vec<_> = ledger_b
        .ordered_entries()
        .iter()
        .map(|d| d.decision_id)
        .collect();
    assert_eq!(order_a, order_b);

    // Local chains stay individually verifiable after absorption.
    ledger_a.verify_chain(0..ledger_a.len()).unwrap();
    ledger_b.verify_chain(0..ledger_b.len()).unwrap();
}

#[tokio::test]
async fn three_node_federation_is_learned_transitively() {
    let transport = Arc::new(MeshTransport::default());
    let a = build_node("node-a", &transport, &[]);
    let b = build_node("node-b", &transport, &[]);
    let c = build_node("node-c", &transport, &[]);

    // Only b knows both sides; a and c learn each other through b's
    // heartbeat advertisements.
    introduce(&a, &b).await;
    introduce(&b, &c).await;
    b.node.heartbeat_tick().await;

    let (healthy, suspect, _) = a.node.status().peer_counts;
    assert_eq!(healthy + suspect, 2);
    let (healthy, suspect, _) = c.node.status().peer_counts;
    assert_eq!(healthy + suspect, 2);
}
