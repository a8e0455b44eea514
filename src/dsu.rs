//! # Disjoint Set Union with Separation Constraints
//!
//! Union-find over raw contact ids used to recompute contact clusters. Forced
//! unions always succeed; heuristic unions are refused when any member of one
//! side carries a keep-separate edge to any member of the other.

use crate::model::RawContactId;
use rustc_hash::{FxHashMap, FxHashSet};

/// Result of attempting to merge two raw contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    /// Already in the same cluster.
    Unchanged,
    /// A keep-separate edge between these two members blocked the merge.
    Blocked {
        a: RawContactId,
        b: RawContactId,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ClusterDsu {
    parent: FxHashMap<RawContactId, RawContactId>,
    rank: FxHashMap<RawContactId, u32>,
    /// Members per root, kept so separation checks need not scan everything.
    members: FxHashMap<RawContactId, Vec<RawContactId>>,
    separated: FxHashMap<RawContactId, FxHashSet<RawContactId>>,
}

impl ClusterDsu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: RawContactId) {
        if self.parent.contains_key(&id) {
            return;
        }
        self.parent.insert(id, id);
        self.rank.insert(id, 0);
        self.members.insert(id, vec![id]);
    }

    pub fn contains(&self, id: RawContactId) -> bool {
        self.parent.contains_key(&id)
    }

    /// Root of `id`, with path halving. Unknown ids are their own root.
    pub fn find(&mut self, id: RawContactId) -> RawContactId {
        let mut current = id;
        loop {
            let Some(&parent) = self.parent.get(&current) else {
                return current;
            };
            if parent == current {
                return current;
            }
            let grandparent = self.parent.get(&parent).copied().unwrap_or(parent);
            self.parent.insert(current, grandparent);
            current = grandparent;
        }
    }

    pub fn same_cluster(&mut self, a: RawContactId, b: RawContactId) -> bool {
        self.find(a) == self.find(b)
    }

    /// Records a keep-separate edge. Only heuristic merges honor it.
    pub fn keep_separate(&mut self, a: RawContactId, b: RawContactId) {
        if a == b {
            return;
        }
        self.separated.entry(a).or_default().insert(b);
        self.separated.entry(b).or_default().insert(a);
    }

    /// Merges regardless of separation edges.
    pub fn force_union(&mut self, a: RawContactId, b: RawContactId) -> MergeResult {
        self.add(a);
        self.add(b);
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return MergeResult::Unchanged;
        }
        self.union_roots(root_a, root_b);
        MergeResult::Success
    }

    /// Merges unless a separation edge crosses the two clusters.
    pub fn try_union(&mut self, a: RawContactId, b: RawContactId) -> MergeResult {
        self.add(a);
        self.add(b);
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return MergeResult::Unchanged;
        }
        if let Some((x, y)) = self.crossing_separation(root_a, root_b) {
            return MergeResult::Blocked { a: x, b: y };
        }
        self.union_roots(root_a, root_b);
        MergeResult::Success
    }

    fn crossing_separation(
        &self,
        root_a: RawContactId,
        root_b: RawContactId,
    ) -> Option<(RawContactId, RawContactId)> {
        let side_a = self.members.get(&root_a)?;
        let side_b = self.members.get(&root_b)?;
        let (small, large) = if side_a.len() <= side_b.len() {
            (side_a, side_b)
        } else {
            (side_b, side_a)
        };
        let large: FxHashSet<RawContactId> = large.iter().copied().collect();
        for member in small {
            if let Some(edges) = self.separated.get(member) {
                if let Some(other) = edges.iter().find(|other| large.contains(other)) {
                    return Some((*member, *other));
                }
            }
        }
        None
    }

    fn union_roots(&mut self, root_a: RawContactId, root_b: RawContactId) {
        let rank_a = self.rank.get(&root_a).copied().unwrap_or(0);
        let rank_b = self.rank.get(&root_b).copied().unwrap_or(0);
        let (child, parent) = if rank_a < rank_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        self.parent.insert(child, parent);
        if rank_a == rank_b {
            self.rank.insert(parent, rank_a + 1);
        }
        let moved = self.members.remove(&child).unwrap_or_default();
        self.members.entry(parent).or_default().extend(moved);
    }

    pub fn cluster_count(&self) -> usize {
        self.members.len()
    }

    /// Every cluster with members ascending, clusters ordered by their
    /// smallest member.
    pub fn clusters(&self) -> Vec<Vec<RawContactId>> {
        let mut clusters: Vec<Vec<RawContactId>> = self
            .members
            .values()
            .map(|members| {
                let mut members = members.clone();
                members.sort_unstable();
                members
            })
            .collect();
        clusters.sort_unstable_by_key(|members| members[0]);
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: i64) -> RawContactId {
        RawContactId(id)
    }

    #[test]
    fn test_singletons() {
        let mut dsu = ClusterDsu::new();
        dsu.add(r(1));
        dsu.add(r(2));
        dsu.add(r(1));
        assert_eq!(dsu.cluster_count(), 2);
        assert!(!dsu.same_cluster(r(1), r(2)));
        assert_eq!(dsu.find(r(99)), r(99));
    }

    #[test]
    fn test_try_union_blocked_across_clusters() {
        let mut dsu = ClusterDsu::new();
        dsu.keep_separate(r(1), r(4));
        assert_eq!(dsu.try_union(r(1), r(2)), MergeResult::Success);
        assert_eq!(dsu.try_union(r(3), r(4)), MergeResult::Success);
        assert_eq!(
            dsu.try_union(r(2), r(3)),
            MergeResult::Blocked { a: r(1), b: r(4) }
        );
        assert_eq!(dsu.cluster_count(), 2);
    }

    #[test]
    fn test_force_union_ignores_separation() {
        let mut dsu = ClusterDsu::new();
        dsu.keep_separate(r(1), r(2));
        assert_eq!(dsu.force_union(r(1), r(2)), MergeResult::Success);
        assert_eq!(dsu.force_union(r(2), r(1)), MergeResult::Unchanged);
        assert!(dsu.same_cluster(r(1), r(2)));
    }

    #[test]
    fn test_clusters_are_sorted() {
        let mut dsu = ClusterDsu::new();
        for id in [5, 3, 9, 1] {
            dsu.add(r(id));
        }
        dsu.force_union(r(9), r(3));
        dsu.force_union(r(5), r(1));
        assert_eq!(
            dsu.clusters(),
            vec![vec![r(1), r(5)], vec![r(3), r(9)]]
        );
    }

    #[test]
    fn test_path_compression_keeps_roots() {
        let mut dsu = ClusterDsu::new();
        for id in 0..64 {
            dsu.force_union(r(id), r(id + 1));
        }
        let root = dsu.find(r(0));
        for id in 0..=64 {
            assert_eq!(dsu.find(r(id)), root);
        }
        assert_eq!(dsu.cluster_count(), 1);
    }
}
