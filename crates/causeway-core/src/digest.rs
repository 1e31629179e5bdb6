//! State digest tree for efficient divergence detection between nodes
//!
//! Each logical state partition (ledger segment, snapshot set, token set)
//! contributes one leaf digest. Leaves are combined pairwise in lexicographic
//! partition-name order, so two nodes holding identical logical state compute
//! identical roots regardless of the order their partitions were updated in.
//!
//! Reconciliation exchanges a [`DigestSummary`] (root plus leaf digests) and
//! calls [`DigestTree::diff`] to find the minimal set of divergent
//! partitions. A partition present on only one side is reported as divergent,
//! which triggers a full-partition resync rather than a partial merge.

use crate::hash::{Hash32, Hasher};
use crate::identifiers::PartitionName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable snapshot of a digest tree, exchanged during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSummary {
    /// Root digest over all leaves.
    pub root: Hash32,
    /// Leaf digest per partition, in deterministic name order.
    pub leaves: BTreeMap<PartitionName, Hash32>,
}

/// Hash tree over named state partitions.
///
/// The root is recomputed lazily: updates mark the tree dirty and the next
/// [`root`](Self::root) call rebuilds the internal levels.
#[derive(Debug, Clone)]
pub struct DigestTree {
    leaves: BTreeMap<PartitionName, Hash32>,
    cached_root: Hash32,
    dirty: bool,
}

impl Default for DigestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestTree {
    /// Create an empty tree. Its root is [`Hash32::ZERO`].
    pub fn new() -> Self {
        Self {
            leaves: BTreeMap::new(),
            cached_root: Hash32::ZERO,
            dirty: false,
        }
    }

    /// Set the digest of one partition, replacing any previous value.
    pub fn update_partition(&mut self, name: PartitionName, digest: Hash32) {
        let previous = self.leaves.insert(name, digest);
        if previous != Some(digest) {
            self.dirty = true;
        }
    }

    /// Drop a partition from the tree.
    ///
    /// The next digest exchange will report it as divergent on whichever
    /// side still carries it.
    pub fn remove_partition(&mut self, name: &PartitionName) {
        if self.leaves.remove(name).is_some() {
            self.dirty = true;
        }
    }

    /// Digest currently recorded for `name`.
    pub fn partition_digest(&self, name: &PartitionName) -> Option<Hash32> {
        self.leaves.get(name).copied()
    }

    /// Current root digest, rebuilding internal levels if needed.
    pub fn root(&mut self) -> Hash32 {
        if self.dirty {
            self.cached_root = Self::compute_root(&self.leaves);
            self.dirty = false;
        }
        self.cached_root
    }

    /// Snapshot the tree for a digest exchange.
    pub fn summary(&mut self) -> DigestSummary {
        DigestSummary {
            root: self.root(),
            leaves: self.leaves.clone(),
        }
    }

    /// Partitions whose digests differ from `other`.
    ///
    /// Returns the minimal divergent set in deterministic name order.
    /// Partitions known to only one side are included.
    pub fn diff(&mut self, other: &DigestSummary) -> Vec<PartitionName> {
        if self.root() == other.root {
            return Vec::new();
        }
        let names: std::collections::BTreeSet<&PartitionName> =
            self.leaves.keys().chain(other.leaves.keys()).collect();
        names
            .into_iter()
            .filter(|name| self.leaves.get(name) != other.leaves.get(name))
            .cloned()
            .collect()
    }

    /// Combine leaf digests pairwise, level by level, into a single root.
    fn compute_root(leaves: &BTreeMap<PartitionName, Hash32>) -> Hash32 {
        if leaves.is_empty() {
            return Hash32::ZERO;
        }
        // Leaf digests are bound to their partition name so swapping two
        // partitions' contents changes the root.
        let mut level: Vec<Hash32> = leaves
            .iter()
            .map(|(name, digest)| {
                let mut h = Hasher::new();
                h.update(name.as_str().as_bytes());
                h.update(b":");
                h.update(digest.as_bytes());
                h.finalize()
            })
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut h = Hasher::new();
                    h.update(pair[0].as_bytes());
                    if let Some(right) = pair.get(1) {
                        h.update(right.as_bytes());
                    }
                    h.finalize()
                })
                .collect();
        }
        level[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash;
    use proptest::prelude::*;

    fn part(s: &str) -> PartitionName {
        PartitionName::new(s)
    }

    #[test]
    fn empty_tree_roots_to_zero() {
        let mut tree = DigestTree::new();
        assert_eq!(tree.root(), Hash32::ZERO);
    }

    #[test]
    fn root_changes_iff_a_leaf_changes() {
        let mut tree = DigestTree::new();
        tree.update_partition(part("decisions"), hash(b"a"));
        let before = tree.root();

        // Re-setting the same digest leaves the root alone.
        tree.update_partition(part("decisions"), hash(b"a"));
        assert_eq!(tree.root(), before);

        tree.update_partition(part("decisions"), hash(b"b"));
        assert_ne!(tree.root(), before);
    }

    #[test]
    fn root_is_update_order_independent() {
        let mut forward = DigestTree::new();
        forward.update_partition(part("decisions"), hash(b"d"));
        forward.update_partition(part("tokens"), hash(b"t"));
        forward.update_partition(part("metering"), hash(b"m"));

        let mut reverse = DigestTree::new();
        reverse.update_partition(part("metering"), hash(b"m"));
        reverse.update_partition(part("tokens"), hash(b"t"));
        reverse.update_partition(part("decisions"), hash(b"d"));

        assert_eq!(forward.root(), reverse.root());
    }

    #[test]
    fn swapping_partition_contents_changes_root() {
        let mut a = DigestTree::new();
        a.update_partition(part("x"), hash(b"one"));
        a.update_partition(part("y"), hash(b"two"));

        let mut b = DigestTree::new();
        b.update_partition(part("x"), hash(b"two"));
        b.update_partition(part("y"), hash(b"one"));

        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn diff_finds_minimal_divergent_set() {
        let mut local = DigestTree::new();
        local.update_partition(part("decisions"), hash(b"same"));
        local.update_partition(part("tokens"), hash(b"local"));

        let mut remote = DigestTree::new();
        remote.update_partition(part("decisions"), hash(b"same"));
        remote.update_partition(part("tokens"), hash(b"remote"));
        remote.update_partition(part("metering"), hash(b"only-remote"));

        let divergent = local.diff(&remote.summary());
        assert_eq!(divergent, vec![part("metering"), part("tokens")]);
    }

    #[test]
    fn diff_of_identical_trees_is_empty() {
        let mut local = DigestTree::new();
        local.update_partition(part("decisions"), hash(b"x"));
        let summary = local.summary();
        assert!(local.diff(&summary).is_empty());
    }

    proptest! {
        #[test]
        fn identical_leaf_sets_agree_on_root(
            entries in prop::collection::btree_map("[a-z]{1,8}", any::<u64>(), 0..12)
        ) {
            let mut a = DigestTree::new();
            let mut b = DigestTree::new();
            for (name, value) in &entries {
                let digest = hash(&value.to_le_bytes());
                a.update_partition(part(name), digest);
            }
            // Insert into b in reverse iteration order.
            for (name, value) in entries.iter().rev() {
                let digest = hash(&value.to_le_bytes());
                b.update_partition(part(name), digest);
            }
            prop_assert_eq!(a.root(), b.root());
            prop_assert!(a.diff(&b.summary()).is_empty());
        }
    }
}
