//! Cheap lower bounds on EMD, used to prune exact evaluations.
//!
//! - `v0`: squared distance between the two centroids. For the squared
//!   Euclidean ground cost, Jensen's inequality gives
//!   `||μ_a − μ_b||² ≤ Σ π_ij ||x_i − y_j||²` for every coupling `π`.
//! - `v1`: each unit of mass must travel at least to its nearest support on
//!   the other side, so `Σ_i a_i min_j C_ij` and `Σ_j b_j min_i C_ij` both
//!   bound EMD from below. `v1` is the largest of these and `v0`, which
//!   makes `v0 ≤ v1 ≤ EMD` hold for every pair.

use crate::block::{Block, Element};
use crate::metric::{pdist2, squared_euclidean, CostMatrix};

/// Centroid lower bound.
pub fn lower_bound_v0(block: &Block, a: &Element<'_>, b: &Element<'_>) -> f64 {
    let metric = block.metric();
    let ca = metric.centroid(a.supports, a.weights);
    let cb = metric.centroid(b.supports, b.weights);
    squared_euclidean(&ca, &cb)
}

/// Nearest-support lower bound, reusing `cost` when the caller has it.
pub fn lower_bound_v1(block: &Block, a: &Element<'_>, b: &Element<'_>, cost: Option<&CostMatrix>) -> f64 {
    let owned;
    let cost = match cost {
        Some(c) => c,
        None => {
            owned = pdist2(block.metric(), a.supports, b.supports);
            &owned
        }
    };
    greedy_bound(a.weights, b.weights, cost).max(lower_bound_v0(block, a, b))
}

/// Row-wise and column-wise nearest-support relaxation of the transport LP.
pub fn greedy_bound(a: &[f64], b: &[f64], cost: &CostMatrix) -> f64 {
    let rows: f64 = a.iter().zip(cost.row_minima()).map(|(w, c)| w * c).sum();
    let cols: f64 = b.iter().zip(cost.col_minima()).map(|(w, c)| w * c).sum();
    rows.max(cols)
}

/// `v0` from `query` to every element of `block`.
pub fn lower_bound_v0_block(query: &Element<'_>, block: &Block) -> Vec<f64> {
    let metric = block.metric();
    let cq = metric.centroid(query.supports, query.weights);
    block
        .iter()
        .map(|e| squared_euclidean(&cq, &metric.centroid(e.supports, e.weights)))
        .collect()
}

/// `v1` from `query` to every element of `block`.
pub fn lower_bound_v1_block(query: &Element<'_>, block: &Block) -> Vec<f64> {
    block
        .iter()
        .map(|e| lower_bound_v1(block, query, &e, None))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emd::emd;
    use crate::metric::GroundMetric;

    fn block() -> Block {
        let mut block = Block::new(GroundMetric::euclidean(1));
        block.push_points(&[0.0, 10.0], &[0.5, 0.5], None).unwrap();
        block.push_points(&[0.0, 10.0], &[0.9, 0.1], None).unwrap();
        block.push_points(&[4.0], &[1.0], None).unwrap();
        block
    }

    #[test]
    fn test_v1_dominates_v0_when_supports_coincide() {
        // same supports, different weights: the greedy part is zero but the
        // centroids are 4 apart
        let block = block();
        let (a, b) = (block.get(0), block.get(1));
        let v0 = lower_bound_v0(&block, &a, &b);
        let v1 = lower_bound_v1(&block, &a, &b, None);
        let exact = emd(&block, &a, &b).unwrap();
        assert!((v0 - 16.0).abs() < 1e-9);
        assert!(v0 <= v1 && v1 <= exact + 1e-9, "{v0} {v1} {exact}");
        assert!((exact - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_greedy_bound_is_tight_for_point_mass() {
        let block = block();
        let (a, c) = (block.get(0), block.get(2));
        let exact = emd(&block, &a, &c).unwrap();
        let v1 = lower_bound_v1(&block, &a, &c, None);
        assert!((v1 - exact).abs() < 1e-9);
    }

    #[test]
    fn test_block_bounds_match_pairwise() {
        let block = block();
        let q = block.get(0);
        let v0 = lower_bound_v0_block(&q, &block);
        let v1 = lower_bound_v1_block(&q, &block);
        for i in 0..block.size() {
            assert!((v0[i] - lower_bound_v0(&block, &q, &block.get(i))).abs() < 1e-12);
            assert!(v0[i] <= v1[i]);
        }
    }
}
