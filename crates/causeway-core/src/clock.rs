//! Causal clock for partial ordering of events across nodes
//!
//! Each node keeps a counter per known node. Local events tick the owner's
//! counter; receiving any message merges the sender's view component-wise.
//! Wall clocks are never consulted, so ordering survives clock skew.
//!
//! Two views are comparable only when one dominates the other in every
//! component; otherwise the events are concurrent and downstream code must
//! apply a deterministic tie-break (node id order) before acting on them.

use crate::identifiers::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Clock handle shared between the provenance and federation layers.
///
/// Every subsystem that stamps or merges causal time holds one of these.
pub type SharedClock = Arc<parking_lot::Mutex<CausalClock>>;

/// Wrap a clock for sharing across subsystems.
pub fn shared_clock(clock: CausalClock) -> SharedClock {
    Arc::new(parking_lot::Mutex::new(clock))
}

/// Ordering relationship between two clock views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// The first view causally precedes the second.
    Before,
    /// The first view causally follows the second.
    After,
    /// Neither view dominates; the events are concurrent.
    Concurrent,
}

/// Immutable, serializable snapshot of a causal clock.
///
/// Stamped onto every decision and every wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockView(pub BTreeMap<NodeId, u64>);

impl ClockView {
    /// Empty view (no observed events).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter observed for `node`, zero if never seen.
    pub fn counter(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Number of nodes with a nonzero counter.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no events have been observed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare two views under the standard vector-clock partial order.
    ///
    /// Equal views are reported as `Concurrent`: neither strictly precedes
    /// the other, and callers fall back to the deterministic tie-break.
    pub fn compare(&self, other: &Self) -> Causality {
        let mut less = false;
        let mut greater = false;
        for node in self.0.keys().chain(other.0.keys()) {
            let a = self.counter(node);
            let b = other.counter(node);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            _ => Causality::Concurrent,
        }
    }
}

/// Per-node causal clock.
///
/// Owned by one node; `tick` advances the owner's counter, `merge` folds in
/// a remote view on message receipt. Never fails and has no side effects
/// beyond its own state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalClock {
    owner: NodeId,
    counters: BTreeMap<NodeId, u64>,
}

impl CausalClock {
    /// Create a clock owned by `owner`, with all counters at zero.
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            counters: BTreeMap::new(),
        }
    }

    /// The node that owns this clock.
    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// Record a local event: increment and return the owner's counter.
    pub fn tick(&mut self) -> u64 {
        let counter = self.counters.entry(self.owner.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Fold a remote view into this clock.
    ///
    /// Every component takes the max of the two sides, then the owner's
    /// counter advances past the highest remote component so the merge
    /// itself is a causally later event.
    pub fn merge(&mut self, remote: &ClockView) {
        let remote_max = remote.0.values().copied().max().unwrap_or(0);
        for (node, counter) in &remote.0 {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
        let own = self.counters.entry(self.owner.clone()).or_insert(0);
        *own = (*own).max(remote_max) + 1;
    }

    /// Snapshot the current view for stamping.
    pub fn view(&self) -> ClockView {
        ClockView(self.counters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn tick_is_monotonic() {
        let mut clock = CausalClock::new(node("x"));
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.view().counter(&node("x")), 2);
    }

    #[test]
    fn merge_takes_component_max_and_advances_owner() {
        let mut x = CausalClock::new(node("x"));
        x.tick();

        let mut y = CausalClock::new(node("y"));
        y.tick();
        y.tick();
        y.tick();

        x.merge(&y.view());
        let view = x.view();
        assert_eq!(view.counter(&node("y")), 3);
        // Owner advances past the highest remote component.
        assert_eq!(view.counter(&node("x")), 4);
    }

    #[test]
    fn message_passing_orders_events() {
        let mut x = CausalClock::new(node("x"));
        x.tick();
        let at_send = x.view();

        let mut y = CausalClock::new(node("y"));
        y.merge(&at_send);
        y.tick();
        let after_receive = y.view();

        assert_eq!(at_send.compare(&after_receive), Causality::Before);
        assert_eq!(after_receive.compare(&at_send), Causality::After);
    }

    #[test]
    fn independent_events_are_concurrent() {
        let mut x = CausalClock::new(node("x"));
        x.tick();
        let mut y = CausalClock::new(node("y"));
        y.tick();

        assert_eq!(x.view().compare(&y.view()), Causality::Concurrent);
        assert_eq!(y.view().compare(&x.view()), Causality::Concurrent);
    }

    #[test]
    fn equal_views_are_concurrent() {
        let mut x = CausalClock::new(node("x"));
        x.tick();
        let view = x.view();
        assert_eq!(view.compare(&view.clone()), Causality::Concurrent);
    }

    proptest! {
        #[test]
        fn merge_never_decreases_components(
            ops in prop::collection::vec((0u8..3, 1u64..50), 1..40)
        ) {
            let peers = [node("a"), node("b"), node("c")];
            let mut clock = CausalClock::new(node("local"));

            for (peer_idx, counter) in ops {
                let before = clock.view();
                let mut remote = BTreeMap::new();
                remote.insert(peers[peer_idx as usize].clone(), counter);
                clock.merge(&ClockView(remote));
                let after = clock.view();
                for (node, prev) in &before.0 {
                    prop_assert!(after.counter(node) >= *prev);
                }
            }
        }

        #[test]
        fn compare_is_antisymmetric(
            a_counts in prop::collection::btree_map(0u8..4, 0u64..20, 0..4),
            b_counts in prop::collection::btree_map(0u8..4, 0u64..20, 0..4),
        ) {
            let to_view = |m: &std::collections::BTreeMap<u8, u64>| {
                ClockView(
                    m.iter()
                        .map(|(k, v)| (NodeId::new(format!("n{k}")), *v))
                        .collect(),
                )
            };
            let a = to_view(&a_counts);
            let b = to_view(&b_counts);
            match a.compare(&b) {
                Causality::Before => prop_assert_eq!(b.compare(&a), Causality::After),
                Causality::After => prop_assert_eq!(b.compare(&a), Causality::Before),
                Causality::Concurrent => prop_assert_eq!(b.compare(&a), Causality::Concurrent),
            }
        }
    }
}
