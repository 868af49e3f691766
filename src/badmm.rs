//! Bregman ADMM between data elements and a classifier ensemble.
//!
//! The cache holds one `col × m` row-major matrix per buffer, where `col`
//! is the number of local support points and `m` the learner length. Rows
//! of element `i` are the block's column span `i`, so the element's
//! submatrix is the contiguous range `offsets[i]*m .. offsets[i+1]*m`.
//!
//! Costs and multipliers are stored pre-divided by the current penalty
//! scale, so an iteration is
//!
//! ```text
//! Π1 ∝ Π2 ⊙ exp(−(C + Λ))     rows sum to the data weights
//! Π2 ∝ Π1 ⊙ exp(Λ)            columns sum to the learner weights
//! Λ  += Π1 − Π2
//! ```

use crate::block::Block;
use crate::error::{D2Error, Result};
use std::ops::Range;

/// Per-element residuals of one BADMM solve.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Residuals {
    /// `Σ |Π1 − Π2|` after the last iteration
    pub primal: f64,
    /// `Σ |Λ_end − Λ_start|`
    pub dual: f64,
}

/// Working buffers for every local element, released on drop.
#[derive(Clone, Debug)]
pub struct BadmmCache {
    learner_len: usize,
    offsets: Vec<usize>,
    c: Vec<f64>,
    ctmp: Vec<f64>,
    pi1: Vec<f64>,
    pi2: Vec<f64>,
    lambda: Vec<f64>,
    scratch: Vec<f64>,
}

impl BadmmCache {
    /// Allocate for `block` and start from the product coupling
    /// `Π_kj = w_k · lw_j` with `Λ = 0`.
    pub fn new(block: &Block, learner_weights: &[f64]) -> Self {
        let m = learner_weights.len();
        let len = block.col() * m;
        let mut pi = Vec::with_capacity(len);
        for w in block.weights() {
            pi.extend(learner_weights.iter().map(|lw| w * lw));
        }
        Self {
            learner_len: m,
            offsets: block.offsets().iter().map(|o| o * m).collect(),
            c: vec![0.0; len],
            ctmp: vec![0.0; len],
            pi1: pi.clone(),
            pi2: pi,
            lambda: vec![0.0; len],
            scratch: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.c.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c.is_empty()
    }

    pub fn learner_len(&self) -> usize {
        self.learner_len
    }

    pub fn num_elements(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Entry range of element `i`.
    pub fn span(&self, i: usize) -> Range<usize> {
        self.offsets[i]..self.offsets[i + 1]
    }

    pub fn cost(&self) -> &[f64] {
        &self.c
    }

    pub fn cost_mut(&mut self) -> &mut [f64] {
        &mut self.c
    }

    /// Cost and label-0 cost buffers together, for building the adjusted cost.
    pub fn cost_and_background_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.c, &mut self.ctmp)
    }

    pub fn pi1(&self) -> &[f64] {
        &self.pi1
    }

    pub fn pi2(&self) -> &[f64] {
        &self.pi2
    }

    pub fn lambda(&self) -> &[f64] {
        &self.lambda
    }

    pub fn lambda_mut(&mut self) -> &mut [f64] {
        &mut self.lambda
    }

    /// Column `j` of `Π2`: the coupling mass of every support point with
    /// classifier `j`.
    pub fn pi2_column(&self, j: usize) -> impl Iterator<Item = f64> + '_ {
        self.pi2.iter().skip(j).step_by(self.learner_len.max(1)).copied()
    }

    pub fn element_mut(&mut self, i: usize) -> BadmmView<'_> {
        let span = self.span(i);
        BadmmView {
            cols: self.learner_len,
            c: &self.c[span.clone()],
            pi1: &mut self.pi1[span.clone()],
            pi2: &mut self.pi2[span.clone()],
            lambda: &mut self.lambda[span.clone()],
            scratch: &mut self.scratch[span],
        }
    }
}

/// One element's submatrices inside a [`BadmmCache`].
pub struct BadmmView<'a> {
    cols: usize,
    c: &'a [f64],
    pi1: &'a mut [f64],
    pi2: &'a mut [f64],
    lambda: &'a mut [f64],
    scratch: &'a mut [f64],
}

impl BadmmView<'_> {
    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.c.len() / self.cols
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn pi1(&self) -> &[f64] {
        self.pi1
    }

    pub fn pi2(&self) -> &[f64] {
        self.pi2
    }
}

/// Write `target · softmax(logits)` into `out`, or `fallback` when the
/// logits carry no usable mass.
fn project(logits: &[f64], target: f64, out: &mut [f64], fallback: impl Fn(usize) -> f64) {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_finite() {
        let total: f64 = logits.iter().map(|l| (l - max).exp()).sum();
        if total.is_finite() && total > 0.0 {
            for (o, l) in out.iter_mut().zip(logits) {
                *o = target * (l - max).exp() / total;
            }
            return;
        }
    }
    for (i, o) in out.iter_mut().enumerate() {
        *o = fallback(i);
    }
}

fn ln_or_neg_inf(x: f64) -> f64 {
    if x > 0.0 {
        x.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Run `iterations` BADMM steps on one element.
pub fn emd_badmm(
    view: &mut BadmmView<'_>,
    data_weights: &[f64],
    learner_weights: &[f64],
    iterations: usize,
) -> Result<Residuals> {
    let (rows, cols) = (view.rows(), view.cols());
    if data_weights.len() != rows {
        return Err(D2Error::dimension_mismatch(rows, data_weights.len()));
    }
    if learner_weights.len() != cols {
        return Err(D2Error::dimension_mismatch(cols, learner_weights.len()));
    }

    view.scratch.copy_from_slice(view.lambda);
    let mut row_logits = vec![0.0; cols];
    let mut col_logits = vec![0.0; rows];
    let mut col_out = vec![0.0; rows];

    for _ in 0..iterations {
        for k in 0..rows {
            let r = k * cols..(k + 1) * cols;
            for (j, l) in row_logits.iter_mut().enumerate() {
                let idx = r.start + j;
                *l = ln_or_neg_inf(view.pi2[idx]) - (view.c[idx] + view.lambda[idx]);
            }
            let w = data_weights[k];
            project(&row_logits, w, &mut view.pi1[r], |j| w * learner_weights[j]);
        }

        for j in 0..cols {
            for (k, l) in col_logits.iter_mut().enumerate() {
                let idx = k * cols + j;
                *l = ln_or_neg_inf(view.pi1[idx]) + view.lambda[idx];
            }
            let lw = learner_weights[j];
            project(&col_logits, lw, &mut col_out, |k| data_weights[k] * lw);
            for (k, v) in col_out.iter().enumerate() {
                view.pi2[k * cols + j] = *v;
            }
        }

        for ((l, p1), p2) in view.lambda.iter_mut().zip(view.pi1.iter()).zip(view.pi2.iter()) {
            *l += p1 - p2;
        }
    }

    let primal = view.pi1.iter().zip(view.pi2.iter()).map(|(a, b)| (a - b).abs()).sum();
    let dual = view.lambda.iter().zip(view.scratch.iter()).map(|(a, b)| (a - b).abs()).sum();
    Ok(Residuals { primal, dual })
}
