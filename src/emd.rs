//! Exact Earth Mover's Distance.
//!
//! EMD between two discrete distributions is the optimum of the
//! transportation problem
//!
//! ```text
//! min  Σ_ij π_ij C_ij   s.t.  Σ_j π_ij = a_i,  Σ_i π_ij = b_j,  π ≥ 0
//! ```
//!
//! solved here with the transportation simplex:
//!
//! 1. **Start**: north-west-corner rule, giving `m + n − 1` basic cells that
//!    form a spanning tree over the `m` row and `n` column nodes.
//! 2. **Pricing**: potentials `u_i + v_j = C_ij` on basic cells; the
//!    non-basic cell with the most negative reduced cost `C_ij − u_i − v_j`
//!    enters.
//! 3. **Pivot**: the entering cell closes a unique cycle in the tree. Flow
//!    `θ` moves around it and the first cell driven to zero leaves.
//!
//! The loop stops when no reduced cost is negative, at which point the plan
//! is optimal and `(u, v)` are the optimal dual potentials.
//!
//! ## Complexity
//!
//! - Pricing: O(m·n) per pivot
//! - Cycle search and potentials: O(m + n) per pivot

use crate::block::{Block, Element, MultiPhaseBlock};
use crate::error::{D2Error, Result};
use crate::metric::{pdist2, CostMatrix};
use std::collections::VecDeque;

/// Relative tolerance on reduced costs.
const REDUCED_COST_TOL: f64 = 1e-12;

/// Optimal coupling of two distributions.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportPlan {
    /// Total transport cost
    pub cost: f64,
    rows: usize,
    cols: usize,
    /// Row-major coupling, `rows × cols`
    pub plan: Vec<f64>,
    /// Dual potential of every row
    pub row_potentials: Vec<f64>,
    /// Dual potential of every column
    pub col_potentials: Vec<f64>,
    /// Simplex pivots performed
    pub pivots: usize,
}

impl TransportPlan {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.plan[i * self.cols + j]
    }
}

#[derive(Clone, Copy, Debug)]
struct BasicCell {
    row: usize,
    col: usize,
    flow: f64,
}

fn unit_mass(weights: &[f64], side: &str) -> Result<Vec<f64>> {
    if weights.is_empty() {
        return Err(D2Error::empty_input(format!("{side} weights")));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(D2Error::invalid_weights(format!(
            "{side} weights must be non-negative and finite"
        )));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(D2Error::invalid_weights(format!("{side} carries no mass")));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

fn north_west_corner(mut supply: Vec<f64>, mut demand: Vec<f64>) -> Vec<BasicCell> {
    let (m, n) = (supply.len(), demand.len());
    let mut basis = Vec::with_capacity(m + n - 1);
    let (mut i, mut j) = (0, 0);
    loop {
        let flow = supply[i].min(demand[j]);
        supply[i] -= flow;
        demand[j] -= flow;
        basis.push(BasicCell { row: i, col: j, flow });
        if i == m - 1 && j == n - 1 {
            break;
        }
        if i == m - 1 {
            j += 1;
        } else if j == n - 1 || supply[i] <= demand[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    basis
}

/// Node `i < m` is row `i`; node `m + j` is column `j`.
fn tree_adjacency(basis: &[BasicCell], m: usize, n: usize) -> Vec<Vec<(usize, usize)>> {
    let mut adj = vec![Vec::new(); m + n];
    for (e, cell) in basis.iter().enumerate() {
        adj[cell.row].push((m + cell.col, e));
        adj[m + cell.col].push((cell.row, e));
    }
    adj
}

fn potentials(
    basis: &[BasicCell],
    adj: &[Vec<(usize, usize)>],
    cost: &CostMatrix,
    u: &mut [f64],
    v: &mut [f64],
) -> Result<()> {
    let m = u.len();
    let mut seen = vec![false; adj.len()];
    let mut stack = vec![0usize];
    seen[0] = true;
    u[0] = 0.0;
    let mut visited = 1;
    while let Some(node) = stack.pop() {
        for &(next, e) in &adj[node] {
            if seen[next] {
                continue;
            }
            let c = cost.get(basis[e].row, basis[e].col);
            if node < m {
                v[next - m] = c - u[node];
            } else {
                u[next] = c - v[node - m];
            }
            seen[next] = true;
            visited += 1;
            stack.push(next);
        }
    }
    if visited != adj.len() {
        return Err(D2Error::numerical_instability(
            "transport basis no longer spans every row and column",
        ));
    }
    Ok(())
}

/// Basis cells on the tree path from `start` to `goal`, ordered from `start`.
fn tree_path(adj: &[Vec<(usize, usize)>], start: usize, goal: usize) -> Option<Vec<usize>> {
    let mut parent: Vec<Option<(usize, usize)>> = vec![None; adj.len()];
    let mut seen = vec![false; adj.len()];
    let mut queue = VecDeque::from([start]);
    seen[start] = true;
    while let Some(node) = queue.pop_front() {
        if node == goal {
            break;
        }
        for &(next, e) in &adj[node] {
            if !seen[next] {
                seen[next] = true;
                parent[next] = Some((node, e));
                queue.push_back(next);
            }
        }
    }
    if !seen[goal] {
        return None;
    }
    let mut path = Vec::new();
    let mut node = goal;
    while let Some((prev, e)) = parent[node] {
        path.push(e);
        node = prev;
    }
    path.reverse();
    Some(path)
}

/// Solve the transportation problem between `a` (rows) and `b` (columns).
///
/// Both weight vectors are normalised to unit mass first.
pub fn transport(a: &[f64], b: &[f64], cost: &CostMatrix) -> Result<TransportPlan> {
    let (m, n) = (a.len(), b.len());
    if cost.rows() != m {
        return Err(D2Error::dimension_mismatch(m, cost.rows()));
    }
    if cost.cols() != n {
        return Err(D2Error::dimension_mismatch(n, cost.cols()));
    }
    let a = unit_mass(a, "source")?;
    let b = unit_mass(b, "target")?;
    if cost.as_slice().iter().any(|c| !c.is_finite()) {
        return Err(D2Error::numerical_instability("cost matrix contains non-finite values"));
    }

    let scale = cost
        .as_slice()
        .iter()
        .fold(1.0_f64, |acc, c| acc.max(c.abs()));
    let tol = REDUCED_COST_TOL * scale;
    let max_pivots = 50 * (m + n) * (m + n) + 1000;

    let mut basis = north_west_corner(a, b);
    let mut u = vec![0.0; m];
    let mut v = vec![0.0; n];
    let mut pivots = 0;

    loop {
        let adj = tree_adjacency(&basis, m, n);
        potentials(&basis, &adj, cost, &mut u, &mut v)?;

        let mut entering = None;
        let mut best = -tol;
        for i in 0..m {
            for j in 0..n {
                let reduced = cost.get(i, j) - u[i] - v[j];
                if reduced < best {
                    best = reduced;
                    entering = Some((i, j));
                }
            }
        }
        let Some((r, c)) = entering else {
            break;
        };
        if pivots >= max_pivots {
            return Err(D2Error::NotOptimal { pivots });
        }

        // the cycle alternates −, +, −, .. starting next to column c
        let path = tree_path(&adj, m + c, r).ok_or_else(|| {
            D2Error::numerical_instability("entering cell does not close a cycle")
        })?;
        let mut leaving = path[0];
        for &e in path.iter().step_by(2) {
            if basis[e].flow < basis[leaving].flow {
                leaving = e;
            }
        }
        let theta = basis[leaving].flow;
        for (k, &e) in path.iter().enumerate() {
            if k % 2 == 0 {
                basis[e].flow -= theta;
            } else {
                basis[e].flow += theta;
            }
        }
        basis[leaving] = BasicCell {
            row: r,
            col: c,
            flow: theta,
        };
        pivots += 1;
    }

    let mut plan = vec![0.0; m * n];
    let mut total = 0.0;
    for cell in &basis {
        let flow = cell.flow.max(0.0);
        plan[cell.row * n + cell.col] += flow;
        total += flow * cost.get(cell.row, cell.col);
    }

    Ok(TransportPlan {
        cost: total,
        rows: m,
        cols: n,
        plan,
        row_potentials: u,
        col_potentials: v,
        pivots,
    })
}

/// Exact EMD between two elements of the same block.
pub fn emd(block: &Block, a: &Element<'_>, b: &Element<'_>) -> Result<f64> {
    let cost = pdist2(block.metric(), a.supports, b.supports);
    Ok(transport(a.weights, b.weights, &cost)?.cost)
}

/// Exact EMD reusing a precomputed cost matrix between `a` and `b`.
pub fn emd_with_cost(a: &Element<'_>, b: &Element<'_>, cost: &CostMatrix) -> Result<TransportPlan> {
    transport(a.weights, b.weights, cost)
}

/// Exact EMD from `query` to every element of `block`.
pub fn emd_to_block(query: &Element<'_>, block: &Block) -> Result<Vec<f64>> {
    block.iter().map(|e| emd(block, query, &e)).collect()
}

/// Exact EMD from `query` to every row of phase `phase`.
pub fn emd_to_phase(query: &Element<'_>, collection: &MultiPhaseBlock, phase: usize) -> Result<Vec<f64>> {
    emd_to_block(query, collection.aligned_phase(phase)?)
}

/// Phase-wise EMD from a multi-phase query row to every row of
/// `collection`: `out[p][j]` compares `query[p]` with row `j` of phase `p`.
pub fn emd_to_collection(query: &[Element<'_>], collection: &MultiPhaseBlock) -> Result<Vec<Vec<f64>>> {
    if query.len() != collection.num_phases() {
        return Err(D2Error::dimension_mismatch(collection.num_phases(), query.len()));
    }
    query
        .iter()
        .enumerate()
        .map(|(p, e)| emd_to_phase(e, collection, p))
        .collect()
}
