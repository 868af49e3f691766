//! Hyperparameters of the marriage-learning loop.

use crate::error::{D2Error, Result};
use serde::{Deserialize, Serialize};

/// How per-classifier sample weights are laid out for fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStrategy {
    /// One background and one labelled copy of every local support point.
    /// All ranks take part in each fit.
    Dense,
    /// Weights accumulated per (vocabulary entry, class) and allreduced.
    /// Only the owning rank fits. Indexed metrics only.
    SparseIndexed,
}

/// What to do when a classifier backend rejects its training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFailurePolicy {
    /// Stop training with `FitFailure` on every rank.
    Abort,
    /// Keep the classifier's previous parameters and continue.
    Skip,
}

/// Configuration for `ml_badmm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlBadmmParams {
    /// Number of training epochs
    pub max_iter: usize,
    /// BADMM iterations per element per epoch
    pub badmm_iter: usize,
    /// Initial BADMM penalty
    pub rho: f64,
    /// Weight of the background class, before division by `len - 1`
    pub beta: f64,
    /// Zero the carried dual scale every `restart` epochs
    pub restart: Option<usize>,
    /// Fit every classifier once on randomly reweighted samples first
    pub bootstrap: bool,
    /// Seed for the bootstrap weights
    pub seed: u64,
    pub sample_strategy: SampleStrategy,
    pub fit_failure: FitFailurePolicy,
}

impl Default for MlBadmmParams {
    fn default() -> Self {
        Self {
            max_iter: 50,
            badmm_iter: 50,
            rho: 10.0,
            beta: 1.0,
            restart: None,
            bootstrap: false,
            seed: 0,
            sample_strategy: SampleStrategy::Dense,
            fit_failure: FitFailurePolicy::Abort,
        }
    }
}

impl MlBadmmParams {
    /// Parameters with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a (possibly partial) JSON document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)
            .map_err(|e| D2Error::invalid_parameter("params", e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Number of training epochs.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// BADMM iterations per element per epoch.
    pub fn with_badmm_iter(mut self, badmm_iter: usize) -> Self {
        self.badmm_iter = badmm_iter;
        self
    }

    /// Initial BADMM penalty.
    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    /// Weight of the background term in the adjusted cost.
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Zero the carried dual scale every `restart` epochs.
    pub fn with_restart(mut self, restart: Option<usize>) -> Self {
        self.restart = restart;
        self
    }

    /// Refit every classifier on randomly reweighted samples before training.
    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Seed of the bootstrap draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// How coupling mass becomes classifier sample weights.
    pub fn with_sample_strategy(mut self, strategy: SampleStrategy) -> Self {
        self.sample_strategy = strategy;
        self
    }

    /// What a failed classifier fit does to the epoch.
    pub fn with_fit_failure(mut self, policy: FitFailurePolicy) -> Self {
        self.fit_failure = policy;
        self
    }

    /// Validate parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.rho.is_finite() && self.rho > 0.0) {
            return Err(D2Error::invalid_parameter("rho", "must be positive and finite"));
        }
        if !(self.beta.is_finite() && self.beta >= 0.0) {
            return Err(D2Error::invalid_parameter("beta", "must be non-negative and finite"));
        }
        if self.badmm_iter == 0 {
            return Err(D2Error::invalid_parameter("badmm_iter", "must be at least 1"));
        }
        if self.restart == Some(0) {
            return Err(D2Error::invalid_parameter("restart", "period must be at least 1"));
        }
        Ok(())
    }
}
