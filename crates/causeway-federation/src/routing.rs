//! Request routing toward the coordinator
//!
//! Operations that must run on the coordinator (ledger writes during a
//! contested term, partition-wide reconciliation triggers) go through the
//! router. While no coordinator is elected, requests wait on the election
//! outcome for a bounded window; a request still unrouted when the window
//! closes surfaces [`EngineError::NoCoordinator`] rather than queueing
//! forever.

use causeway_core::{EngineConfig, EngineError, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Where a routed request should execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDecision {
    /// This node is the coordinator; execute locally.
    Local,
    /// Forward to the current coordinator.
    Forward(NodeId),
}

/// Routes coordinator-bound requests, waiting out elections.
pub struct Router {
    node_id: NodeId,
    retry_window: Duration,
    coordinator_tx: watch::Sender<Option<NodeId>>,
    coordinator_rx: watch::Receiver<Option<NodeId>>,
}

impl Router {
    /// Create a router with no coordinator known yet.
    pub fn new(config: &EngineConfig) -> Self {
        let (coordinator_tx, coordinator_rx) = watch::channel(None);
        Self {
            node_id: config.node_id.clone(),
            retry_window: Duration::from_millis(config.route_retry_window_ms),
            coordinator_tx,
            coordinator_rx,
        }
    }

    /// Publish the coordinator the consensus layer currently recognizes.
    ///
    /// `None` during an election; waiting routes resume when a new value
    /// arrives.
    pub fn set_coordinator(&self, coordinator: Option<NodeId>) {
        self.coordinator_tx.send_if_modified(|current| {
            if *current == coordinator {
                return false;
            }
            debug!(coordinator = ?coordinator, "routing target changed");
            *current = coordinator;
            true
        });
    }

    /// Coordinator currently recognized, if any.
    pub fn current_coordinator(&self) -> Option<NodeId> {
        self.coordinator_rx.borrow().clone()
    }

    /// Decide where a coordinator-bound request should run.
    ///
    /// Waits up to the configured retry window for an election to settle.
    pub async fn route(&self) -> Result<RouteDecision> {
        let mut rx = self.coordinator_rx.clone();
        let wait = async {
            loop {
                if let Some(coordinator) = rx.borrow_and_update().clone() {
                    return self.decision(coordinator);
                }
                if rx.changed().await.is_err() {
                    return Err(EngineError::NoCoordinator);
                }
            }
        };
        tokio::time::timeout(self.retry_window, wait)
            .await
            .map_err(|_| EngineError::NoCoordinator)?
    }

    fn decision(&self, coordinator: NodeId) -> Result<RouteDecision> {
        if coordinator == self.node_id {
            Ok(RouteDecision::Local)
        } else {
            Ok(RouteDecision::Forward(coordinator))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(id: &str) -> Router {
        Router::new(&EngineConfig::new(NodeId::new(id)))
    }

    #[tokio::test]
    async fn coordinator_self_routes_locally() {
        let router = router("n1");
        router.set_coordinator(Some(NodeId::new("n1")));
        assert_eq!(router.route().await.unwrap(), RouteDecision::Local);
    }

    #[tokio::test]
    async fn follower_forwards_to_coordinator() {
        let router = router("n2");
        router.set_coordinator(Some(NodeId::new("n1")));
        assert_eq!(
            router.route().await.unwrap(),
            RouteDecision::Forward(NodeId::new("n1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn route_waits_out_an_election() {
        let router = std::sync::Arc::new(router("n2"));

        let waiting = {
            let router = router.clone();
            tokio::spawn(async move { router.route().await })
        };
        // Let the route call park on the watch channel.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(100)).await;
        router.set_coordinator(Some(NodeId::new("n1")));

        let decision = waiting.await.unwrap().unwrap();
        assert_eq!(decision, RouteDecision::Forward(NodeId::new("n1")));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_election_times_out() {
        let router = router("n2");
        let err = router.route().await.unwrap_err();
        assert_eq!(err, EngineError::NoCoordinator);
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_loss_blocks_new_routes() {
        let router = router("n2");
        router.set_coordinator(Some(NodeId::new("n1")));
        assert!(router.route().await.is_ok());

        router.set_coordinator(None);
        let err = router.route().await.unwrap_err();
        assert_eq!(err, EngineError::NoCoordinator);
    }
}
