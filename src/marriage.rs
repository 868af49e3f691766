//! Marriage learning: jointly learn a coupling between data support points
//! and a classifier ensemble, and the classifiers themselves.
//!
//! Every epoch rebuilds the adjusted cost
//! `C_kj = F_j.cost(x_k, y_k) − β · F_j.cost(x_k, 0)`, rescales the BADMM
//! state, runs BADMM on every local element, refits each classifier on
//! weights read off its coupling column and reports accuracy. All ranks
//! issue the same collectives in the same order; reduced scalars are
//! recomputed every epoch.

use crate::badmm::{emd_badmm, BadmmCache};
use crate::block::Block;
use crate::classifier::{Classifier, Learner, Ownership, TrainingSet};
use crate::collective::Collective;
use crate::config::{FitFailurePolicy, MlBadmmParams, SampleStrategy};
use crate::error::{D2Error, Result};
use crate::metric::StorageMode;
use crate::predict::{accuracy, Accuracy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;
const TOTAL_COST_FLOOR: f64 = 1e-12;

/// Metrics of one training epoch, identical on every rank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Zero-based epoch index
    pub epoch: usize,
    /// Mean adjusted transport cost per element
    pub loss: f64,
    /// `rho · totalC`
    pub scale: f64,
    /// Penalty after this epoch's adaptation
    pub rho: f64,
    /// Mean `Σ |Π1 − Π2|` over all elements
    pub primal_residual: f64,
    /// Mean change of the dual variables over all elements
    pub dual_residual: f64,
    pub train: Accuracy,
    /// One entry per validation block, in order
    pub validation: Vec<Accuracy>,
}

/// Make every rank fail together when any rank fails a local check.
fn agree(local: Result<()>, stage: &str, comm: &dyn Collective) -> Result<()> {
    let failed = comm.allreduce_scalar(f64::from(u8::from(local.is_err())))?;
    local?;
    if failed > 0.0 {
        return Err(D2Error::PeerFailure {
            stage: stage.to_string(),
        });
    }
    Ok(())
}

fn check_preconditions<F: Classifier>(data: &Block, learner: &Learner<F>, params: &MlBadmmParams) -> Result<()> {
    params.validate()?;
    if learner.len() <= 1 {
        return Err(D2Error::invalid_parameter(
            "learner",
            format!("needs more than one classifier, got {}", learner.len()),
        ));
    }
    let num_classes = learner.num_classes();
    if num_classes < 2 {
        return Err(D2Error::invalid_parameter(
            "learner",
            "needs a background class and at least one real class",
        ));
    }
    if learner.dim() != data.metric().dim() {
        return Err(D2Error::dimension_mismatch(data.metric().dim(), learner.dim()));
    }
    for (element, label) in data.labels().iter().enumerate() {
        if !matches!(label, Some(l) if (1..num_classes).contains(l)) {
            return Err(D2Error::InvalidLabel {
                element,
                label: *label,
                num_classes,
            });
        }
    }
    if params.sample_strategy == SampleStrategy::SparseIndexed
        && (data.metric().storage() != StorageMode::Indexed || data.metric().vocabulary().is_none())
    {
        return Err(D2Error::invalid_parameter(
            "sample_strategy",
            format!("sparse sample weights need an indexed metric, got {}", data.metric().name()),
        ));
    }
    data.check_simplex()
}

/// Training samples derived from the local block for one strategy.
struct SampleLayout {
    strategy: SampleStrategy,
    dim: usize,
    features: Vec<f64>,
    labels: Vec<usize>,
    /// Vocabulary index and label of every local support (sparse only)
    support_index: Vec<usize>,
    support_label: Vec<usize>,
    vocabulary: usize,
}

impl SampleLayout {
    fn new(data: &Block, strategy: SampleStrategy, num_classes: usize) -> Result<Self> {
        let metric = data.metric();
        let dim = metric.dim();
        let support_label: Vec<usize> = data.support_labels().into_iter().map(|l| l.unwrap_or(0)).collect();
        match strategy {
            SampleStrategy::Dense => {
                let embedded = data.embedded_supports();
                let mut features = Vec::with_capacity(embedded.len() * 2);
                features.extend_from_slice(&embedded);
                features.extend_from_slice(&embedded);
                let mut labels = vec![0; data.col()];
                labels.extend_from_slice(&support_label);
                Ok(Self {
                    strategy,
                    dim,
                    features,
                    labels,
                    support_index: Vec::new(),
                    support_label,
                    vocabulary: 0,
                })
            }
            SampleStrategy::SparseIndexed => {
                let vocabulary = metric
                    .vocabulary()
                    .ok_or_else(|| D2Error::invalid_parameter("sample_strategy", "metric has no vocabulary"))?;
                let supports = data.supports();
                let support_index = (0..data.col())
                    .map(|k| {
                        supports
                            .index(k)
                            .ok_or_else(|| D2Error::invalid_parameter("supports", "expected indexed supports"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut features = Vec::with_capacity(num_classes * vocabulary * dim);
                let mut labels = Vec::with_capacity(num_classes * vocabulary);
                for c in 0..num_classes {
                    for v in 0..vocabulary {
                        features.extend_from_slice(&metric.index_coordinate(v));
                        labels.push(c);
                    }
                }
                Ok(Self {
                    strategy,
                    dim,
                    features,
                    labels,
                    support_index,
                    support_label,
                    vocabulary,
                })
            }
        }
    }

    /// Sample weights for the classifier whose coupling column is `pi`.
    ///
    /// The sparse strategy allreduces, so every rank must call this for
    /// every classifier.
    fn weights(
        &self,
        data: &Block,
        pi: impl Iterator<Item = f64>,
        beta: f64,
        comm: &dyn Collective,
    ) -> Result<Vec<f64>> {
        let col = data.col();
        match self.strategy {
            SampleStrategy::Dense => {
                let mut out = vec![0.0; 2 * col];
                for (k, (p, w)) in pi.zip(data.weights()).enumerate() {
                    out[k] = (beta * (w - p)).max(0.0);
                    out[col + k] = p;
                }
                Ok(out)
            }
            SampleStrategy::SparseIndexed => {
                let mut out = vec![0.0; self.labels.len()];
                for (k, (p, w)) in pi.zip(data.weights()).enumerate() {
                    let v = self.support_index[k];
                    out[v + self.vocabulary * self.support_label[k]] += p;
                    out[v] += beta * (w - p);
                }
                comm.allreduce_sum(&mut out)?;
                for w in &mut out {
                    *w = w.max(0.0);
                }
                Ok(out)
            }
        }
    }

    fn training_set<'a>(&'a self, weights: &'a [f64]) -> Result<TrainingSet<'a>> {
        TrainingSet::new(&self.features, self.dim, &self.labels, weights)
    }
}

/// Refit every classifier in ownership batches, then synchronise each batch
/// from its owners.
fn refit<F: Classifier>(
    learner: &mut Learner<F>,
    layout: &SampleLayout,
    policy: FitFailurePolicy,
    comm: &dyn Collective,
    mut weights_for: impl FnMut(usize) -> Result<Vec<f64>>,
) -> Result<()> {
    let ownership = Ownership::new(comm.world_size());
    let rank = comm.rank();
    for batch in ownership.batches(learner.len()) {
        let mut outcomes = Vec::with_capacity(batch.len());
        for j in batch.clone() {
            let weights = weights_for(j)?;
            let set = layout.training_set(&weights)?;
            let previous = learner.classifiers()[j].clone();
            let result = match layout.strategy {
                SampleStrategy::Dense => learner.classifier_mut(j).fit(&set, Some(comm)),
                SampleStrategy::SparseIndexed if ownership.is_owner(j, rank) => {
                    learner.classifier_mut(j).fit(&set, None)
                }
                SampleStrategy::SparseIndexed => Ok(()),
            };
            if result.is_err() && policy == FitFailurePolicy::Skip {
                *learner.classifier_mut(j) = previous;
            }
            outcomes.push(result);
        }

        for (j, outcome) in batch.zip(outcomes) {
            let owner = ownership.owner(j);
            let ok = learner.sync_classifier(j, owner, outcome.is_ok(), comm)?;
            if ok {
                continue;
            }
            let reason = match outcome {
                Err(e) => e.to_string(),
                Ok(()) => format!("fit failed on rank {owner}"),
            };
            match policy {
                FitFailurePolicy::Abort => return Err(D2Error::fit_failure(j, reason)),
                FitFailurePolicy::Skip => {
                    if rank == 0 {
                        warn!(classifier = j, %reason, "fit failed, keeping previous parameters");
                    }
                }
            }
        }
    }
    Ok(())
}

fn bootstrap_seed(seed: u64, classifier: usize, rank: usize) -> u64 {
    seed ^ (classifier as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (rank as u64).rotate_left(32)
}

/// Fill the cache's cost buffer with the adjusted cost under the current
/// classifiers.
fn adjusted_cost<F: Classifier>(
    cache: &mut BadmmCache,
    learner: &Learner<F>,
    features: &[f64],
    dim: usize,
    support_label: &[usize],
    beta: f64,
) {
    let m = learner.len();
    let (c, background) = cache.cost_and_background_mut();
    for (k, y) in support_label.iter().enumerate() {
        let x = &features[k * dim..(k + 1) * dim];
        for (j, f) in learner.classifiers().iter().enumerate() {
            let idx = k * m + j;
            background[idx] = f.cost(x, 0);
            c[idx] = f.cost(x, *y) - beta * background[idx];
        }
    }
}

/// Train `learner` in place on `data` for `params.max_iter` epochs.
///
/// `data` is this rank's shard; every rank calls with its own shard, the
/// same learner configuration and the same parameters. Validation blocks
/// are evaluated but never trained on.
pub fn ml_badmm<F: Classifier>(
    data: &Block,
    learner: &mut Learner<F>,
    params: &MlBadmmParams,
    validation: &[&Block],
    comm: &dyn Collective,
) -> Result<Vec<EpochReport>> {
    agree(check_preconditions(data, learner, params), "precondition checks", comm)?;

    let rank = comm.rank();
    let m = learner.len();
    let num_classes = learner.num_classes();
    let beta = params.beta / (m - 1) as f64;

    let mut counts = [data.col() as f64, data.size() as f64];
    comm.allreduce_sum(&mut counts)?;
    let (global_col, global_size) = (counts[0], counts[1]);
    if global_size == 0.0 {
        return Err(D2Error::empty_input("no training elements on any rank"));
    }

    learner.reset_weights();
    let ownership = Ownership::new(comm.world_size());
    for j in 0..m {
        learner.classifier_mut(j).init();
    }
    for batch in ownership.batches(m) {
        for j in batch {
            learner.sync_classifier(j, ownership.owner(j), true, comm)?;
        }
    }

    let learner_weights = learner.weights().to_vec();
    let mut cache = BadmmCache::new(data, &learner_weights);
    let layout = SampleLayout::new(data, params.sample_strategy, num_classes)?;
    let features = data.embedded_supports();
    let dim = data.metric().dim();

    if params.bootstrap {
        if rank == 0 {
            debug!(seed = params.seed, "initialising classifiers from bootstrap samples");
        }
        refit(learner, &layout, params.fit_failure, comm, |j| {
            let mut weights = layout.weights(data, cache.pi2_column(j), beta, comm)?;
            let mut rng = StdRng::seed_from_u64(bootstrap_seed(params.seed, j, rank));
            for w in &mut weights {
                *w *= rng.gen::<f64>();
            }
            Ok(weights)
        })?;
    }

    let mut rho = params.rho;
    let (mut primal, mut dual, mut total_c) = (1.0, 1.0, 0.0);
    let mut reports = Vec::with_capacity(params.max_iter);

    for epoch in 0..params.max_iter {
        adjusted_cost(&mut cache, learner, &features, dim, &layout.support_label, beta);

        let mut carried_scale = total_c * rho;
        if primal < 0.5 * dual {
            rho /= 2.0;
        }
        if dual < 0.5 * primal {
            rho *= 2.0;
        }
        rho = rho.clamp(RHO_MIN, RHO_MAX);
        let abs_sum: f64 = cache.cost().iter().map(|c| c.abs()).sum();
        total_c = (comm.allreduce_scalar(abs_sum)? / (global_col * m as f64)).max(TOTAL_COST_FLOOR);
        if matches!(params.restart, Some(r) if epoch % r == 0) {
            carried_scale = 0.0;
        }

        let scale = rho * total_c;
        for c in cache.cost_mut() {
            *c /= scale;
        }
        let carry = carried_scale / scale;
        for l in cache.lambda_mut() {
            *l *= carry;
        }

        let local_loss: f64 = cache.cost().iter().zip(cache.pi2()).map(|(c, p)| c * p).sum();
        let loss = comm.allreduce_scalar(local_loss)? / global_size * scale;

        let mut residuals = [0.0, 0.0];
        for i in 0..data.size() {
            let e = data.get(i);
            let res = emd_badmm(&mut cache.element_mut(i), e.weights, &learner_weights, params.badmm_iter)?;
            residuals[0] += res.primal;
            residuals[1] += res.dual;
        }
        comm.allreduce_sum(&mut residuals)?;
        primal = residuals[0] / global_size;
        dual = residuals[1] / global_size;

        refit(learner, &layout, params.fit_failure, comm, |j| {
            layout.weights(data, cache.pi2_column(j), beta, comm)
        })?;
        comm.barrier()?;

        let train = accuracy(data, learner, comm)?;
        let validation = validation
            .iter()
            .map(|block| accuracy(block, learner, comm))
            .collect::<Result<Vec<_>>>()?;

        if rank == 0 {
            info!(
                epoch,
                loss,
                scale,
                rho,
                primal_residual = primal,
                dual_residual = dual,
                train_wta = train.winner_take_all,
                train_voting = train.voting,
                "marriage learning epoch"
            );
        }
        reports.push(EpochReport {
            epoch,
            loss,
            scale,
            rho,
            primal_residual: primal,
            dual_residual: dual,
            train,
            validation,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SoftmaxRegression;
    use crate::collective::SingleProcess;
    use crate::metric::{Embedding, GroundMetric};

    fn data() -> Block {
        let mut block = Block::new(GroundMetric::euclidean(1));
        block.push_points(&[-2.0, -1.0], &[0.5, 0.5], Some(1)).unwrap();
        block.push_points(&[-1.5], &[1.0], Some(1)).unwrap();
        block.push_points(&[1.0, 2.0], &[0.5, 0.5], Some(2)).unwrap();
        block.push_points(&[1.5], &[1.0], Some(2)).unwrap();
        block
    }

    fn learner(len: usize) -> Learner<SoftmaxRegression> {
        Learner::new(vec![SoftmaxRegression::new(3, 1); len]).unwrap()
    }

    #[test]
    fn test_single_classifier_is_rejected() {
        let mut l = learner(1);
        let err = ml_badmm(&data(), &mut l, &MlBadmmParams::default(), &[], &SingleProcess).unwrap_err();
        assert!(matches!(err, D2Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_background_label_is_rejected() {
        let mut block = data();
        block.push_points(&[0.0], &[1.0], Some(0)).unwrap();
        let mut l = learner(2);
        let err = ml_badmm(&block, &mut l, &MlBadmmParams::default(), &[], &SingleProcess).unwrap_err();
        assert!(matches!(err, D2Error::InvalidLabel { element: 4, .. }));
    }

    #[test]
    fn test_sparse_strategy_needs_indexed_metric() {
        let params = MlBadmmParams::default().with_sample_strategy(SampleStrategy::SparseIndexed);
        let mut l = learner(2);
        assert!(ml_badmm(&data(), &mut l, &params, &[], &SingleProcess).is_err());
    }

    #[test]
    fn test_dense_layout_duplicates_supports() {
        let block = data();
        let layout = SampleLayout::new(&block, SampleStrategy::Dense, 3).unwrap();
        assert_eq!(layout.labels.len(), 2 * block.col());
        assert_eq!(&layout.labels[..block.col()], &[0; 6]);
        assert_eq!(&layout.labels[block.col()..], &[1, 1, 1, 2, 2, 2]);
        let pi = vec![0.25; block.col()];
        let w = layout.weights(&block, pi.into_iter(), 1.0, &SingleProcess).unwrap();
        assert!((w[0] - 0.25).abs() < 1e-12);
        assert_eq!(w[2], 0.75);
        assert_eq!(w[block.col()], 0.25);
    }

    #[test]
    fn test_sparse_layout_accumulates_by_index() {
        let vocab = Embedding::from_rows(&[vec![0.0], vec![1.0], vec![2.0]]).unwrap();
        let mut block = Block::new(GroundMetric::WordVec(vocab));
        block.push_indexed(&[0, 2], &[0.5, 0.5], Some(1)).unwrap();
        block.push_indexed(&[2], &[1.0], Some(2)).unwrap();
        let layout = SampleLayout::new(&block, SampleStrategy::SparseIndexed, 3).unwrap();
        assert_eq!(layout.labels.len(), 9);
        let pi = vec![0.25, 0.25, 0.5];
        let w = layout.weights(&block, pi.into_iter(), 1.0, &SingleProcess).unwrap();
        // word 2 appears with label 1 and label 2
        assert!((w[2 + 3] - 0.25).abs() < 1e-12);
        assert!((w[2 + 6] - 0.5).abs() < 1e-12);
        assert!((w[2] - 0.75).abs() < 1e-12);
        assert!((w[0] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_one_epoch_reports_sane_metrics() {
        let block = data();
        let mut l = learner(2);
        let params = MlBadmmParams::default().with_max_iter(1).with_beta(0.5).with_badmm_iter(10);
        let reports = ml_badmm(&block, &mut l, &params, &[&block], &SingleProcess).unwrap();
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert!(r.loss >= 0.0);
        assert!(r.primal_residual >= 0.0 && r.dual_residual >= 0.0);
        assert!((0.0..=1.0).contains(&r.train.voting));
        assert_eq!(r.validation, vec![r.train]);
    }
}
