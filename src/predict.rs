//! Class prediction from a trained learner.
//!
//! Both predictors treat class 0 as background: it is never predicted, and
//! only classes `1..K` compete. Accuracy is reduced over all ranks.

use crate::block::Block;
use crate::classifier::{Classifier, Learner};
use crate::collective::Collective;
use crate::emd::transport;
use crate::error::Result;
use crate::metric::CostMatrix;
use serde::{Deserialize, Serialize};

/// Accuracy of both predictors on one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Accuracy {
    pub winner_take_all: f64,
    pub voting: f64,
}

fn element_features<'a>(features: &'a [f64], dim: usize, block: &Block, i: usize) -> &'a [f64] {
    let span = block.span(i);
    &features[span.start * dim..span.end * dim]
}

fn global_accuracy(correct: usize, size: usize, comm: &dyn Collective) -> Result<f64> {
    let mut buf = [correct as f64, size as f64];
    comm.allreduce_sum(&mut buf)?;
    if buf[1] == 0.0 {
        return Ok(0.0);
    }
    Ok(buf[0] / buf[1])
}

/// EMD between each element and the learner under every class's cost;
/// the class with the smallest distance wins.
///
/// `scores`, when given, receives the distances row-major as
/// `size × num_classes`.
pub fn predict_winner_take_all<F: Classifier>(
    data: &Block,
    learner: &Learner<F>,
    comm: &dyn Collective,
    scores: Option<&mut Vec<f64>>,
) -> Result<f64> {
    let num_classes = learner.num_classes();
    let dim = data.metric().dim();
    let features = data.embedded_supports();
    let mut emds = vec![0.0; data.size() * num_classes];

    for i in 0..data.size() {
        let e = data.get(i);
        let x = element_features(&features, dim, data, i);
        for c in 0..num_classes {
            let cost = learner.cost_matrix(x, dim, |_| c);
            emds[i * num_classes + c] = transport(e.weights, learner.weights(), &cost)?.cost;
        }
    }

    let mut correct = 0;
    for (i, row) in emds.chunks(num_classes).enumerate() {
        let mut label = 1;
        for c in 2..num_classes {
            if row[c] < row[label] {
                label = c;
            }
        }
        if data.labels()[i] == Some(label) {
            correct += 1;
        }
    }

    if let Some(scores) = scores {
        *scores = emds;
    }
    global_accuracy(correct, data.size(), comm)
}

/// Couple each element with the learner under the best-of-classes cost,
/// then vote with the coupling mass each class receives.
///
/// `proportions`, when given, receives the per-class mass row-major as
/// `size × num_classes`.
pub fn predict_voting<F: Classifier>(
    data: &Block,
    learner: &Learner<F>,
    comm: &dyn Collective,
    proportions: Option<&mut Vec<f64>>,
) -> Result<f64> {
    let num_classes = learner.num_classes();
    let m = learner.len();
    let dim = data.metric().dim();
    let features = data.embedded_supports();
    let mut votes = vec![0.0; data.size() * num_classes];
    let mut correct = 0;

    for i in 0..data.size() {
        let e = data.get(i);
        let x = element_features(&features, dim, data, i);
        let per_class: Vec<CostMatrix> = (0..num_classes)
            .map(|c| learner.cost_matrix(x, dim, |_| c))
            .collect();

        let mut best = vec![0usize; e.len() * m];
        let cost = CostMatrix::from_fn(e.len(), m, |k, j| {
            let mut value = f64::MAX;
            let mut index = 0;
            for (c, costs) in per_class.iter().enumerate().skip(1) {
                if value > costs.get(k, j) {
                    value = costs.get(k, j);
                    index = c;
                }
            }
            best[k * m + j] = index;
            value - per_class[0].get(k, j)
        });
        let plan = transport(e.weights, learner.weights(), &cost)?;

        let mass = &mut votes[i * num_classes..(i + 1) * num_classes];
        for (p, c) in plan.plan.iter().zip(&best) {
            mass[*c] += p;
        }
        let mut label = 1;
        for c in 2..num_classes {
            if mass[c] > mass[label] {
                label = c;
            }
        }
        if e.label == Some(label) {
            correct += 1;
        }
    }

    if let Some(proportions) = proportions {
        *proportions = votes;
    }
    global_accuracy(correct, data.size(), comm)
}

/// Both predictors on `data`.
pub fn accuracy<F: Classifier>(data: &Block, learner: &Learner<F>, comm: &dyn Collective) -> Result<Accuracy> {
    Ok(Accuracy {
        winner_take_all: predict_winner_take_all(data, learner, comm, None)?,
        voting: predict_voting(data, learner, comm, None)?,
    })
}
