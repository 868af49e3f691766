//! k-nearest-neighbor search under exact EMD.
//!
//! [`knn_linear`] evaluates every candidate. [`knn_pruned`] visits candidates
//! in order of their centroid bound and skips the exact solve whenever a
//! lower bound already exceeds the current k-th best distance. Both return
//! the same neighbors in the same `(distance, index)` order.

use crate::block::{Block, Element, MultiPhaseBlock};
use crate::bounds::{greedy_bound, lower_bound_v0_block};
use crate::emd::{emd, transport};
use crate::error::Result;
use crate::metric::pdist2;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

/// Relative slack before a lower bound is trusted to prune.
const PRUNE_SLACK: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

/// Work done by a pruned search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Candidates solved exactly
    pub exact: usize,
    /// Candidates discarded by a lower bound
    pub pruned: usize,
}

fn by_distance_then_index(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.index.cmp(&b.index))
}

fn select(mut candidates: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    candidates.sort_by(by_distance_then_index);
    candidates.truncate(k);
    candidates
}

/// Exact EMD to every candidate, then the `k` smallest.
pub fn knn_linear(k: usize, query: &Element<'_>, block: &Block) -> Result<Vec<Neighbor>> {
    let candidates = block
        .iter()
        .enumerate()
        .map(|(index, e)| Ok(Neighbor { index, distance: emd(block, query, &e)? }))
        .collect::<Result<Vec<_>>>()?;
    Ok(select(candidates, k))
}

/// Lower-bound pruned search; identical results to [`knn_linear`].
pub fn knn_pruned(k: usize, query: &Element<'_>, block: &Block) -> Result<(Vec<Neighbor>, PruneStats)> {
    let k = k.min(block.size());
    let mut stats = PruneStats::default();
    if k == 0 {
        return Ok((Vec::new(), stats));
    }

    let v0 = lower_bound_v0_block(query, block);
    let mut order: Vec<usize> = (0..block.size()).collect();
    order.sort_by(|&i, &j| v0[i].total_cmp(&v0[j]).then(i.cmp(&j)));

    // max-heap of the k best (distance, index) pairs seen so far
    let mut best: BinaryHeap<(OrderedFloat<f64>, usize)> = BinaryHeap::with_capacity(k + 1);
    let mut evaluated = Vec::new();
    let threshold = |best: &BinaryHeap<(OrderedFloat<f64>, usize)>| -> f64 {
        if best.len() < k {
            f64::INFINITY
        } else {
            best.peek().map(|(d, _)| d.0).unwrap_or(f64::INFINITY)
        }
    };
    let exceeds = |bound: f64, thr: f64| bound > thr + PRUNE_SLACK * (1.0 + thr.abs());

    for (visited, &index) in order.iter().enumerate() {
        let thr = threshold(&best);
        if exceeds(v0[index], thr) {
            // candidates are sorted by v0, so the rest are worse too
            stats.pruned += order.len() - visited;
            break;
        }
        let e = block.get(index);
        let cost = pdist2(block.metric(), query.supports, e.supports);
        if exceeds(greedy_bound(query.weights, e.weights, &cost), thr) {
            stats.pruned += 1;
            continue;
        }
        let distance = transport(query.weights, e.weights, &cost)?.cost;
        stats.exact += 1;
        evaluated.push(Neighbor { index, distance });
        best.push((OrderedFloat(distance), index));
        if best.len() > k {
            best.pop();
        }
    }

    debug!(
        exact = stats.exact,
        pruned = stats.pruned,
        candidates = block.size(),
        "pruned knn search finished"
    );
    Ok((select(evaluated, k), stats))
}

/// [`knn_linear`] over one phase of a multi-phase collection.
pub fn knn_linear_phase(
    k: usize,
    query: &Element<'_>,
    collection: &MultiPhaseBlock,
    phase: usize,
) -> Result<Vec<Neighbor>> {
    knn_linear(k, query, collection.aligned_phase(phase)?)
}

/// [`knn_pruned`] over one phase of a multi-phase collection.
pub fn knn_pruned_phase(
    k: usize,
    query: &Element<'_>,
    collection: &MultiPhaseBlock,
    phase: usize,
) -> Result<(Vec<Neighbor>, PruneStats)> {
    knn_pruned(k, query, collection.aligned_phase(phase)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::GroundMetric;

    fn line_block() -> Block {
        let mut block = Block::new(GroundMetric::euclidean(1));
        for x in [5.0, 1.0, 3.0, 1.0, 8.0, 0.0] {
            block.push_points(&[x, x + 0.5], &[0.5, 0.5], None).unwrap();
        }
        block
    }

    #[test]
    fn test_linear_orders_by_distance_then_index() {
        let block = line_block();
        let query = block.get(5);
        let nn = knn_linear(3, &query, &block).unwrap();
        let indices: Vec<usize> = nn.iter().map(|n| n.index).collect();
        // elements 1 and 3 tie, the lower index wins
        assert_eq!(indices, vec![5, 1, 3]);
        assert!(nn[0].distance.abs() < 1e-12);
    }

    #[test]
    fn test_pruned_matches_linear_and_prunes() {
        let block = line_block();
        let query = block.get(5);
        let linear = knn_linear(2, &query, &block).unwrap();
        let (pruned, stats) = knn_pruned(2, &query, &block).unwrap();
        assert_eq!(linear, pruned);
        assert!(stats.pruned > 0);
        assert_eq!(stats.exact + stats.pruned, block.size());
    }

    #[test]
    fn test_k_is_clamped() {
        let block = line_block();
        let query = block.get(0);
        assert_eq!(knn_linear(100, &query, &block).unwrap().len(), block.size());
        assert_eq!(knn_pruned(100, &query, &block).unwrap().0.len(), block.size());
        assert!(knn_pruned(0, &query, &block).unwrap().0.is_empty());
    }
}
