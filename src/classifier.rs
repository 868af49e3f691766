//! Classifier ensemble used as the "support" of the learner.
//!
//! A classifier plays the role of a support point: its transport cost to a
//! data point is the negative log-likelihood it assigns to a label there.
//! Class 0 is reserved for "not mine" (background); real labels are `1..K`.
//!
//! Each classifier has one owning rank (`i % world`). Fitted parameters are
//! broadcast from the owner in batches of `world` consecutive classifiers,
//! so after a batch every rank holds an identical read-only replica.

use crate::collective::Collective;
use crate::error::{D2Error, Result};
use crate::metric::CostMatrix;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Weighted, labelled samples handed to [`Classifier::fit`].
#[derive(Clone, Copy, Debug)]
pub struct TrainingSet<'a> {
    features: &'a [f64],
    dim: usize,
    labels: &'a [usize],
    weights: &'a [f64],
}

impl<'a> TrainingSet<'a> {
    pub fn new(features: &'a [f64], dim: usize, labels: &'a [usize], weights: &'a [f64]) -> Result<Self> {
        if labels.len() != weights.len() {
            return Err(D2Error::dimension_mismatch(labels.len(), weights.len()));
        }
        if features.len() != labels.len() * dim {
            return Err(D2Error::dimension_mismatch(labels.len() * dim, features.len()));
        }
        Ok(Self {
            features,
            dim,
            labels,
            weights,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &'a [f64] {
        &self.features[i * self.dim..(i + 1) * self.dim]
    }

    pub fn labels(&self) -> &'a [usize] {
        self.labels
    }

    pub fn weights(&self) -> &'a [f64] {
        self.weights
    }
}

/// A pluggable classifier backend.
pub trait Classifier: Clone {
    /// Number of classes including the background class 0.
    fn num_classes(&self) -> usize;

    /// Length of the feature vectors the classifier is evaluated on.
    fn dim(&self) -> usize;

    /// Reset to the untrained state.
    fn init(&mut self);

    /// Fit on weighted samples. With `comm`, every rank calls `fit` on its
    /// local samples and the backend reduces across ranks; without it the
    /// samples are complete and no communication may happen.
    fn fit(&mut self, set: &TrainingSet<'_>, comm: Option<&dyn Collective>) -> Result<()>;

    /// Negative log-likelihood of `label` at feature vector `x`.
    fn cost(&self, x: &[f64], label: usize) -> f64;

    fn parameters(&self) -> Vec<f64>;

    fn load_parameters(&mut self, params: &[f64]) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxConfig {
    /// Gradient-descent step size
    pub learning_rate: f64,
    /// Full-batch iterations per fit
    pub iterations: usize,
    /// L2 penalty on the non-bias weights
    pub l2: f64,
}

impl Default for SoftmaxConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            iterations: 100,
            l2: 1e-3,
        }
    }
}

/// Weighted multinomial logistic regression.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftmaxRegression {
    config: SoftmaxConfig,
    num_classes: usize,
    dim: usize,
    /// `num_classes × (dim + 1)`, bias last in each row
    weights: Vec<f64>,
}

impl SoftmaxRegression {
    pub fn new(num_classes: usize, dim: usize) -> Self {
        Self {
            config: SoftmaxConfig::default(),
            num_classes,
            dim,
            weights: vec![0.0; num_classes * (dim + 1)],
        }
    }

    pub fn with_config(mut self, config: SoftmaxConfig) -> Self {
        self.config = config;
        self
    }

    fn logits(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .chunks(self.dim + 1)
            .map(|row| {
                let (w, bias) = row.split_at(self.dim);
                bias[0] + w.iter().zip(x).map(|(a, b)| a * b).sum::<f64>()
            })
            .collect()
    }

    fn probabilities(&self, x: &[f64]) -> Vec<f64> {
        let logits = self.logits(x);
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        exp.into_iter().map(|e| e / total).collect()
    }

    fn check(&self, set: &TrainingSet<'_>) -> Option<String> {
        if set.dim() != self.dim {
            return Some(format!("feature dimension {} != {}", set.dim(), self.dim));
        }
        if let Some(l) = set.labels().iter().find(|l| **l >= self.num_classes) {
            return Some(format!("label {l} outside {} classes", self.num_classes));
        }
        if set.weights().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Some("sample weights must be non-negative and finite".to_string());
        }
        if set.features.iter().any(|x| !x.is_finite()) {
            return Some("features must be finite".to_string());
        }
        None
    }
}

impl Classifier for SoftmaxRegression {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn init(&mut self) {
        self.weights.fill(0.0);
    }

    fn fit(&mut self, set: &TrainingSet<'_>, comm: Option<&dyn Collective>) -> Result<()> {
        let problem = self.check(set);
        if let Some(comm) = comm {
            // every rank must leave together, before any gradient exchange
            let failed = comm.allreduce_scalar(f64::from(u8::from(problem.is_some())))?;
            if failed > 0.0 {
                return Err(D2Error::invalid_parameter(
                    "training set",
                    problem.unwrap_or_else(|| "rejected on a peer rank".to_string()),
                ));
            }
        } else if let Some(reason) = problem {
            return Err(D2Error::invalid_parameter("training set", reason));
        }

        let mut total: f64 = set.weights().iter().sum();
        if let Some(comm) = comm {
            total = comm.allreduce_scalar(total)?;
        }
        if total <= 0.0 {
            return Ok(());
        }

        let stride = self.dim + 1;
        let mut grad = vec![0.0; self.weights.len()];
        for _ in 0..self.config.iterations {
            grad.fill(0.0);
            for i in 0..set.len() {
                let w = set.weights()[i];
                if w == 0.0 {
                    continue;
                }
                let x = set.row(i);
                let p = self.probabilities(x);
                for (c, pc) in p.iter().enumerate() {
                    let g = w * (pc - f64::from(u8::from(set.labels()[i] == c)));
                    let row = &mut grad[c * stride..(c + 1) * stride];
                    for (gk, xk) in row.iter_mut().zip(x) {
                        *gk += g * xk;
                    }
                    row[self.dim] += g;
                }
            }
            if let Some(comm) = comm {
                comm.allreduce_sum(&mut grad)?;
            }
            for (k, (w, g)) in self.weights.iter_mut().zip(&grad).enumerate() {
                let penalty = if k % stride == self.dim { 0.0 } else { self.config.l2 * *w };
                *w -= self.config.learning_rate * (g / total + penalty);
            }
        }
        if self.weights.iter().any(|w| !w.is_finite()) {
            return Err(D2Error::numerical_instability("softmax weights diverged"));
        }
        Ok(())
    }

    fn cost(&self, x: &[f64], label: usize) -> f64 {
        let logits = self.logits(x);
        let Some(target) = logits.get(label) else {
            return f64::INFINITY;
        };
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + logits.iter().map(|l| (l - max).exp()).sum::<f64>().ln();
        lse - target
    }

    fn parameters(&self) -> Vec<f64> {
        self.weights.clone()
    }

    fn load_parameters(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.weights.len() {
            return Err(D2Error::dimension_mismatch(self.weights.len(), params.len()));
        }
        self.weights.copy_from_slice(params);
        Ok(())
    }
}

/// Round-robin assignment of classifiers to ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ownership {
    world: usize,
}

impl Ownership {
    pub fn new(world: usize) -> Self {
        Self { world: world.max(1) }
    }

    pub fn owner(&self, classifier: usize) -> usize {
        classifier % self.world
    }

    pub fn is_owner(&self, classifier: usize, rank: usize) -> bool {
        self.owner(classifier) == rank
    }

    /// Synchronisation batches: `world` consecutive classifiers each, so
    /// every rank owns at most one classifier per batch.
    pub fn batches(&self, len: usize) -> impl Iterator<Item = Range<usize>> {
        let world = self.world;
        (0..len)
            .step_by(world)
            .map(move |start| start..(start + world).min(len))
    }
}

/// An ordered ensemble of classifiers with combining weights.
#[derive(Clone, Debug)]
pub struct Learner<F: Classifier> {
    classifiers: Vec<F>,
    weights: Vec<f64>,
}

impl<F: Classifier> Learner<F> {
    /// Ensemble with uniform combining weights.
    pub fn new(classifiers: Vec<F>) -> Result<Self> {
        let Some(first) = classifiers.first() else {
            return Err(D2Error::empty_input("learner without classifiers"));
        };
        let k = first.num_classes();
        if k == 0 {
            return Err(D2Error::invalid_parameter("learner", "classifiers with zero classes"));
        }
        if let Some(bad) = classifiers.iter().find(|c| c.num_classes() != k) {
            return Err(D2Error::dimension_mismatch(k, bad.num_classes()));
        }
        let dim = first.dim();
        if let Some(bad) = classifiers.iter().find(|c| c.dim() != dim) {
            return Err(D2Error::dimension_mismatch(dim, bad.dim()));
        }
        let len = classifiers.len();
        Ok(Self {
            classifiers,
            weights: vec![1.0 / len as f64; len],
        })
    }

    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classifiers[0].num_classes()
    }

    /// Feature dimension shared by every classifier.
    pub fn dim(&self) -> usize {
        self.classifiers[0].dim()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn reset_weights(&mut self) {
        let len = self.len() as f64;
        self.weights.fill(1.0 / len);
    }

    pub fn classifiers(&self) -> &[F] {
        &self.classifiers
    }

    pub fn classifier_mut(&mut self, i: usize) -> &mut F {
        &mut self.classifiers[i]
    }

    /// Costs between support points (rows of `features`) and classifiers
    /// (columns), with `label(k)` the label evaluated at support `k`.
    pub fn cost_matrix(&self, features: &[f64], dim: usize, label: impl Fn(usize) -> usize) -> CostMatrix {
        let rows = if dim == 0 { 0 } else { features.len() / dim };
        CostMatrix::from_fn(rows, self.len(), |k, j| {
            self.classifiers[j].cost(&features[k * dim..(k + 1) * dim], label(k))
        })
    }

    /// Broadcast classifier `i` from `owner`, together with the owner's fit
    /// status. Returns the status every rank now agrees on.
    pub fn sync_classifier(&mut self, i: usize, owner: usize, fit_ok: bool, comm: &dyn Collective) -> Result<bool> {
        let params = self.classifiers[i].parameters();
        let mut buf = Vec::with_capacity(params.len() + 1);
        buf.push(f64::from(u8::from(fit_ok)));
        buf.extend_from_slice(&params);
        comm.broadcast(&mut buf, owner)?;
        self.classifiers[i].load_parameters(&buf[1..])?;
        Ok(buf[0] > 0.0)
    }
}
