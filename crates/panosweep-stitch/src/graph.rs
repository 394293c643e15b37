//! Match graph assembly.
//!
//! Frames are nodes; accepted pairs are edges weighted by pair confidence.
//! Camera estimation needs the graph to be connected, walks a maximum
//! confidence spanning tree from its most central node, and uses that node
//! as the reference camera.
//!
//! Frames that register onto each other with no measurable motion show the
//! same view. They are collapsed into their lowest index before the graph is
//! built.

use std::collections::BTreeMap;

use petgraph::algo::{connected_components, dijkstra};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Bfs, EdgeRef};

use crate::pairs::PairMatch;

/// Undirected graph over frame indices, edge weight = index into the pair
/// list it was built from.
#[derive(Debug, Clone)]
pub struct MatchGraph {
    graph: UnGraph<usize, usize>,
}

/// One step of a walk down the spanning tree: `child` is reached from
/// `parent` through `pairs[pair]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStep {
    pub parent: usize,
    pub child: usize,
    pub pair: usize,
}

/// Maximum-confidence spanning tree rooted at its center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanningTree {
    /// Node with minimal eccentricity (lowest index on ties).
    pub center: usize,
    /// Breadth-first steps from the center; every other node appears as a
    /// child exactly once.
    pub steps: Vec<TreeStep>,
}

/// Frames left after duplicate views are collapsed.
#[derive(Debug, Clone)]
pub struct Collapsed {
    /// Input indices of the surviving frames, ascending.
    pub kept: Vec<usize>,
    /// Pairs reindexed onto positions in `kept`, `from < to`.
    pub pairs: Vec<PairMatch>,
}

impl Collapsed {
    /// Number of input frames folded into another one.
    #[must_use]
    pub fn duplicates(&self, frame_count: usize) -> usize {
        frame_count - self.kept.len()
    }
}

/// Merge frames joined by a pair whose mean inlier motion is at most
/// `max_motion` registration pixels.
///
/// Pairs touching a merged frame are moved onto its survivor; pairs inside
/// one merged set are dropped, and of several pairs landing on the same
/// survivors the most confident wins.
#[must_use]
pub fn collapse_duplicates(
    frame_count: usize,
    pairs: Vec<PairMatch>,
    max_motion: f64,
) -> Collapsed {
    let mut sets = UnionFind::new(frame_count);
    for pair in &pairs {
        if pair.mean_motion() <= max_motion {
            sets.union(pair.from, pair.to);
        }
    }

    let mut slot = vec![usize::MAX; frame_count];
    let mut kept = Vec::new();
    let position: Vec<usize> = (0..frame_count)
        .map(|i| {
            let root = sets.find(i);
            if slot[root] == usize::MAX {
                slot[root] = kept.len();
                kept.push(i);
            }
            slot[root]
        })
        .collect();
    if kept.len() == frame_count {
        return Collapsed { kept, pairs };
    }

    let mut best: BTreeMap<(usize, usize), PairMatch> = BTreeMap::new();
    for pair in pairs {
        let (from, to) = (position[pair.from], position[pair.to]);
        let moved = match from.cmp(&to) {
            std::cmp::Ordering::Equal => continue,
            std::cmp::Ordering::Less => PairMatch { from, to, ..pair },
            std::cmp::Ordering::Greater => match pair.reversed() {
                Some(back) => PairMatch {
                    from: to,
                    to: from,
                    ..back
                },
                None => continue,
            },
        };
        let key = (moved.from, moved.to);
        if best
            .get(&key)
            .is_none_or(|existing| existing.confidence < moved.confidence)
        {
            best.insert(key, moved);
        }
    }
    Collapsed {
        kept,
        pairs: best.into_values().collect(),
    }
}

impl MatchGraph {
    #[must_use]
    pub fn new(frame_count: usize, pairs: &[PairMatch]) -> Self {
        let mut graph = UnGraph::with_capacity(frame_count, pairs.len());
        for i in 0..frame_count {
            graph.add_node(i);
        }
        for (idx, pair) in pairs.iter().enumerate() {
            graph.add_edge(NodeIndex::new(pair.from), NodeIndex::new(pair.to), idx);
        }
        Self { graph }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        connected_components(&self.graph)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.component_count() <= 1
    }

    /// Kruskal over descending confidence, then rooted at the tree center.
    ///
    /// On a disconnected graph the tree spans only the center's component.
    #[must_use]
    pub fn spanning_tree(&self, pairs: &[PairMatch]) -> SpanningTree {
        let n = self.graph.node_count();
        let mut order: Vec<usize> = (0..pairs.len()).collect();
        order.sort_by(|&a, &b| {
            pairs[b]
                .confidence
                .total_cmp(&pairs[a].confidence)
                .then(a.cmp(&b))
        });

        let mut sets = UnionFind::new(n);
        let mut tree: UnGraph<usize, usize> = UnGraph::with_capacity(n, n.saturating_sub(1));
        for i in 0..n {
            tree.add_node(i);
        }
        for idx in order {
            let pair = &pairs[idx];
            if sets.union(pair.from, pair.to) {
                tree.add_edge(NodeIndex::new(pair.from), NodeIndex::new(pair.to), idx);
            }
        }

        let center = tree_center(&tree);
        let steps = walk(&tree, center);
        SpanningTree { center, steps }
    }
}

fn tree_center(tree: &UnGraph<usize, usize>) -> usize {
    (0..tree.node_count())
        .map(|i| {
            let eccentricity = dijkstra(tree, NodeIndex::new(i), None, |_| 1usize)
                .values()
                .copied()
                .max()
                .unwrap_or(0);
            (eccentricity, i)
        })
        .min()
        .map_or(0, |(_, i)| i)
}

fn walk(tree: &UnGraph<usize, usize>, center: usize) -> Vec<TreeStep> {
    if tree.node_count() == 0 {
        return Vec::new();
    }
    let mut steps = Vec::new();
    let mut seen = vec![false; tree.node_count()];
    let mut bfs = Bfs::new(tree, NodeIndex::new(center));
    seen[center] = true;
    while let Some(node) = bfs.next(tree) {
        let mut edges: Vec<_> = tree.edges(node).collect();
        let other_end = |e: &petgraph::graph::EdgeReference<'_, usize>| {
            let end = if e.source() == node {
                e.target()
            } else {
                e.source()
            };
            end.index()
        };
        edges.sort_by_key(other_end);
        for edge in edges {
            let other = other_end(&edge);
            if !seen[other] {
                seen[other] = true;
                steps.push(TreeStep {
                    parent: node.index(),
                    child: other,
                    pair: *edge.weight(),
                });
            }
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use nalgebra::Matrix3;

    use super::*;
    use crate::homography::Pt;

    fn pair(from: usize, to: usize, confidence: f64) -> PairMatch {
        PairMatch {
            from,
            to,
            h: Matrix3::identity(),
            matches: 0,
            inlier_count: 0,
            inliers: Vec::new(),
            confidence,
        }
    }

    fn still(from: usize, to: usize, confidence: f64) -> PairMatch {
        let p = Pt::new(5.0, -2.0);
        PairMatch {
            inliers: vec![(p, p)],
            ..pair(from, to, confidence)
        }
    }

    fn moving(from: usize, to: usize, confidence: f64) -> PairMatch {
        PairMatch {
            inliers: vec![(Pt::new(0.0, 0.0), Pt::new(40.0, 0.0))],
            ..pair(from, to, confidence)
        }
    }

    #[test]
    fn repeated_view_collapses_to_one_frame() {
        let pairs = vec![still(0, 1, 5.0), still(1, 2, 5.0), still(0, 2, 5.0)];
        let collapsed = collapse_duplicates(3, pairs, 1.0);
        assert_eq!(collapsed.kept, vec![0]);
        assert!(collapsed.pairs.is_empty());
        assert_eq!(collapsed.duplicates(3), 2);
    }

    #[test]
    fn pairs_move_onto_survivors() {
        // 0 and 2 show the same view; 1 and 3 are distinct.
        let pairs = vec![
            moving(0, 1, 2.0),
            still(0, 2, 6.0),
            moving(1, 2, 3.0),
            moving(2, 3, 2.5),
        ];
        let collapsed = collapse_duplicates(4, pairs, 1.0);
        assert_eq!(collapsed.kept, vec![0, 1, 3]);
        let ends: Vec<_> = collapsed.pairs.iter().map(|p| (p.from, p.to)).collect();
        assert_eq!(ends, vec![(0, 1), (0, 2)]);
        // (1, 2) folded onto (0, 1) and beat the weaker direct pair.
        assert!((collapsed.pairs[0].confidence - 3.0).abs() < 1e-12);
        assert_eq!(collapsed.pairs[0].inliers[0].1, Pt::new(0.0, 0.0));
        assert!(MatchGraph::new(3, &collapsed.pairs).is_connected());
    }

    #[test]
    fn distinct_frames_are_untouched() {
        let pairs = vec![moving(0, 1, 2.0), moving(1, 2, 2.0)];
        let collapsed = collapse_duplicates(3, pairs, 1.0);
        assert_eq!(collapsed.kept, vec![0, 1, 2]);
        assert_eq!(collapsed.pairs.len(), 2);
    }

    #[test]
    fn chain_is_connected_with_middle_center() {
        let pairs = vec![pair(0, 1, 2.0), pair(1, 2, 2.0), pair(2, 3, 2.0), pair(3, 4, 2.0)];
        let graph = MatchGraph::new(5, &pairs);
        assert!(graph.is_connected());
        let tree = graph.spanning_tree(&pairs);
        assert_eq!(tree.center, 2);
        assert_eq!(tree.steps.len(), 4);
    }

    #[test]
    fn split_graph_reports_components() {
        let pairs = vec![pair(0, 1, 2.0), pair(2, 3, 2.0)];
        let graph = MatchGraph::new(5, &pairs);
        assert_eq!(graph.component_count(), 3);
        assert!(!graph.is_connected());
    }

    #[test]
    fn tree_prefers_confident_edges() {
        // Triangle: the weakest edge (0, 2) must be left out.
        let pairs = vec![pair(0, 1, 3.0), pair(1, 2, 2.5), pair(0, 2, 1.1)];
        let tree = MatchGraph::new(3, &pairs).spanning_tree(&pairs);
        assert!(tree.steps.iter().all(|s| s.pair != 2));
        assert_eq!(tree.center, 1);
    }

    #[test]
    fn every_node_is_reached_once() {
        let pairs = vec![
            pair(0, 1, 2.0),
            pair(0, 2, 1.5),
            pair(1, 2, 1.8),
            pair(2, 3, 2.2),
            pair(1, 3, 1.2),
        ];
        let tree = MatchGraph::new(4, &pairs).spanning_tree(&pairs);
        let mut children: Vec<_> = tree.steps.iter().map(|s| s.child).collect();
        children.sort_unstable();
        let mut expected: Vec<_> = (0..4).filter(|&i| i != tree.center).collect();
        expected.sort_unstable();
        assert_eq!(children, expected);
    }

    #[test]
    fn single_node_tree_has_no_steps() {
        let tree = MatchGraph::new(1, &[]).spanning_tree(&[]);
        assert_eq!(tree.center, 0);
        assert!(tree.steps.is_empty());
    }
}
