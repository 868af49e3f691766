/// End-to-end marriage learning runs: single process, simulated workers,
/// both sample-weight strategies and both fit-failure policies.

use d2ml::*;
use std::thread;

fn run<T: Send>(world: usize, f: impl Fn(&LocalWorker) -> T + Sync) -> Vec<T> {
    let workers = LocalGroup::new(world).unwrap();
    thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                let f = &f;
                s.spawn(move || f(&w))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Four elements, two classes, one dimension.
fn toy_data() -> Block {
    let mut block = Block::new(GroundMetric::euclidean(1));
    block.push_points(&[-2.0, -1.0], &[0.5, 0.5], Some(1)).unwrap();
    block.push_points(&[-1.5, -0.5, -2.5], &[0.2, 0.3, 0.5], Some(1)).unwrap();
    block.push_points(&[1.0, 2.0], &[0.5, 0.5], Some(2)).unwrap();
    block.push_points(&[1.5], &[1.0], Some(2)).unwrap();
    block
}

fn larger_data() -> Block {
    let mut block = Block::new(GroundMetric::euclidean(1));
    for i in 0..10 {
        let x = 0.3 * i as f64 + 0.5;
        block.push_points(&[-x, -x - 0.4], &[0.6, 0.4], Some(1)).unwrap();
        block.push_points(&[x, x + 0.4], &[0.6, 0.4], Some(2)).unwrap();
    }
    block
}

fn learner(len: usize) -> Learner<SoftmaxRegression> {
    let config = SoftmaxConfig {
        learning_rate: 0.5,
        iterations: 50,
        l2: 1e-3,
    };
    Learner::new(vec![SoftmaxRegression::new(3, 1).with_config(config); len]).unwrap()
}

fn params() -> MlBadmmParams {
    MlBadmmParams::default()
        .with_max_iter(1)
        .with_badmm_iter(20)
        .with_beta(0.5)
}

#[test]
fn test_single_epoch_scenario() {
    println!("\n=== ML_BADMM: 2 classifiers, 4 elements, 1 epoch ===");

    let data = toy_data();
    let mut l = learner(2);
    let reports = ml_badmm(&data, &mut l, &params(), &[], &SingleProcess).unwrap();

    assert_eq!(reports.len(), 1);
    let r = &reports[0];
    println!("{:?}", r);
    assert!(r.loss >= 0.0, "loss {}", r.loss);
    assert!(r.primal_residual >= 0.0);
    assert!(r.dual_residual >= 0.0);
    assert!((0.0..=1.0).contains(&r.train.winner_take_all));
    assert!((0.0..=1.0).contains(&r.train.voting));
    assert!(r.validation.is_empty());
    println!("✓ PASSED");
}

#[test]
fn test_single_worker_runs_are_bit_reproducible() {
    println!("\n=== ML_BADMM: reproducibility ===");

    let data = toy_data();
    let p = params().with_max_iter(3).with_seed(11);

    let mut first = learner(2);
    let mut second = learner(2);
    let a = ml_badmm(&data, &mut first, &p, &[&data], &SingleProcess).unwrap();
    let b = ml_badmm(&data, &mut second, &p, &[&data], &SingleProcess).unwrap();

    assert_eq!(a, b);
    for (x, y) in first.classifiers().iter().zip(second.classifiers()) {
        assert_eq!(x.parameters(), y.parameters());
    }
    println!("✓ PASSED");
}

#[test]
fn test_bootstrap_is_seeded() {
    println!("\n=== ML_BADMM: seeded bootstrap ===");

    let data = toy_data();
    let p = params().with_bootstrap(true).with_seed(3);
    let mut first = learner(3);
    let mut second = learner(3);
    let a = ml_badmm(&data, &mut first, &p, &[], &SingleProcess).unwrap();
    let b = ml_badmm(&data, &mut second, &p, &[], &SingleProcess).unwrap();
    assert_eq!(a, b);
    println!("✓ PASSED");
}

#[test]
fn test_single_classifier_fails_fast() {
    println!("\n=== ML_BADMM: learner.len == 1 ===");

    let mut l = learner(1);
    let err = ml_badmm(&toy_data(), &mut l, &params(), &[], &SingleProcess).unwrap_err();
    println!("error: {}", err);
    assert!(matches!(err, D2Error::InvalidParameter { .. }));
    println!("✓ PASSED");
}

#[test]
fn test_training_learns_separable_data() {
    println!("\n=== ML_BADMM: several epochs ===");

    let data = larger_data();
    let mut l = learner(2);
    let p = params().with_max_iter(5).with_restart(Some(2));
    let reports = ml_badmm(&data, &mut l, &p, &[], &SingleProcess).unwrap();

    for r in &reports {
        println!(
            "epoch {} loss {:.4} rho {} prim {:.4} dual {:.4} acc {:.2}/{:.2}",
            r.epoch, r.loss, r.rho, r.primal_residual, r.dual_residual, r.train.winner_take_all, r.train.voting
        );
        assert!(r.loss.is_finite() && r.scale > 0.0);
        assert!((1e-6..=1e6).contains(&r.rho));
    }
    let last = reports.last().unwrap();
    assert!(last.train.winner_take_all >= 0.9, "{:?}", last.train);
    println!("✓ PASSED");
}

#[test]
fn test_workers_agree_on_every_report() {
    println!("\n=== ML_BADMM: dense strategy on 2 workers ===");

    let data = larger_data();
    let p = params().with_max_iter(2);
    let results = run(2, |w| {
        let shard = data.shard(w.rank(), 2).unwrap();
        let mut l = learner(3);
        let reports = ml_badmm(&shard, &mut l, &p, &[], w).unwrap();
        let params: Vec<Vec<f64>> = l.classifiers().iter().map(|c| c.parameters()).collect();
        (reports, params)
    });
    assert_eq!(results[0], results[1]);
    println!("✓ PASSED");
}

#[test]
fn test_sparse_strategy_on_word_vectors() {
    println!("\n=== ML_BADMM: sparse strategy, word vectors, 2 workers ===");

    let table = Embedding::from_rows(&[
        vec![-2.0],
        vec![-1.0],
        vec![-0.5],
        vec![0.5],
        vec![1.0],
        vec![2.0],
    ])
    .unwrap();
    let mut docs = Block::new(GroundMetric::WordVec(table));
    docs.push_indexed(&[0, 1], &[1.0, 1.0], Some(1)).unwrap();
    docs.push_indexed(&[1, 2], &[2.0, 1.0], Some(1)).unwrap();
    docs.push_indexed(&[0, 2], &[1.0, 3.0], Some(1)).unwrap();
    docs.push_indexed(&[3, 4], &[1.0, 1.0], Some(2)).unwrap();
    docs.push_indexed(&[4, 5], &[1.0, 2.0], Some(2)).unwrap();
    docs.push_indexed(&[3, 5], &[3.0, 1.0], Some(2)).unwrap();

    let p = params()
        .with_max_iter(3)
        .with_sample_strategy(SampleStrategy::SparseIndexed);
    let results = run(2, |w| {
        let shard = docs.shard(w.rank(), 2).unwrap();
        let mut l = learner(2);
        ml_badmm(&shard, &mut l, &p, &[&docs], w).unwrap()
    });
    assert_eq!(results[0], results[1]);
    for r in &results[0] {
        assert!(r.loss.is_finite());
        assert!((0.0..=1.0).contains(&r.validation[0].voting));
    }
    println!("✓ PASSED");
}

#[test]
fn test_classifier_dimension_is_checked_before_training() {
    println!("\n=== ML_BADMM: classifier dimension != data dimension ===");

    // 2-D classifiers against 1-D supports must fail before any epoch,
    // even when fit failures would otherwise be skipped
    let mut l = Learner::new(vec![SoftmaxRegression::new(3, 2); 2]).unwrap();
    let p = params()
        .with_max_iter(3)
        .with_fit_failure(FitFailurePolicy::Skip);
    let err = ml_badmm(&toy_data(), &mut l, &p, &[], &SingleProcess).unwrap_err();
    println!("error: {}", err);
    assert!(matches!(err, D2Error::DimensionMismatch { expected: 1, got: 2 }));
    println!("✓ PASSED");
}

#[test]
fn test_precondition_failure_on_one_rank_stops_all() {
    println!("\n=== ML_BADMM: precondition agreement ===");

    let data = toy_data();
    let results = run(2, |w| {
        let mut shard = data.shard(w.rank(), 2).unwrap();
        if w.rank() == 1 {
            shard.push_points(&[0.0], &[1.0], Some(7)).unwrap();
        }
        let mut l = learner(2);
        ml_badmm(&shard, &mut l, &params(), &[], w)
    });
    assert!(matches!(results[0], Err(D2Error::PeerFailure { .. })));
    assert!(matches!(results[1], Err(D2Error::InvalidLabel { .. })));
    println!("✓ PASSED");
}

/// A backend that can be told to reject every fit.
#[derive(Clone, Debug)]
struct Flaky {
    inner: SoftmaxRegression,
    fail: bool,
}

impl Classifier for Flaky {
    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn init(&mut self) {
        self.inner.init();
    }

    fn fit(&mut self, set: &TrainingSet<'_>, comm: Option<&dyn Collective>) -> Result<()> {
        if self.fail {
            return Err(D2Error::numerical_instability("refusing to fit"));
        }
        self.inner.fit(set, comm)
    }

    fn cost(&self, x: &[f64], label: usize) -> f64 {
        self.inner.cost(x, label)
    }

    fn parameters(&self) -> Vec<f64> {
        self.inner.parameters()
    }

    fn load_parameters(&mut self, params: &[f64]) -> Result<()> {
        self.inner.load_parameters(params)
    }
}

fn flaky_learner() -> Learner<Flaky> {
    let inner = SoftmaxRegression::new(3, 1);
    Learner::new(vec![
        Flaky {
            inner: inner.clone(),
            fail: false,
        },
        Flaky { inner, fail: true },
    ])
    .unwrap()
}

#[test]
fn test_fit_failure_aborts() {
    println!("\n=== ML_BADMM: fit failure, abort policy ===");

    let mut l = flaky_learner();
    let err = ml_badmm(&toy_data(), &mut l, &params(), &[], &SingleProcess).unwrap_err();
    println!("error: {}", err);
    assert!(matches!(err, D2Error::FitFailure { index: 1, .. }));
    println!("✓ PASSED");
}

#[test]
fn test_fit_failure_skip_keeps_previous_parameters() {
    println!("\n=== ML_BADMM: fit failure, skip policy ===");

    let mut l = flaky_learner();
    let p = params()
        .with_max_iter(2)
        .with_fit_failure(FitFailurePolicy::Skip);
    let reports = ml_badmm(&toy_data(), &mut l, &p, &[], &SingleProcess).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(l.classifiers()[1].parameters().iter().all(|w| *w == 0.0));
    assert!(l.classifiers()[0].parameters().iter().any(|w| *w != 0.0));
    println!("✓ PASSED");
}
