//! Train a small classifier ensemble by marriage learning on two simulated
//! workers, then look up nearest neighbors of a held-out element.
//!
//! ```text
//! cargo run --example marriage_demo [params.json]
//! RUST_LOG=d2ml=debug cargo run --example marriage_demo
//! ```

use d2ml::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WORLD: usize = 2;

/// Blobs around (±2, 0); each element is a handful of jittered points.
fn synthetic(rng: &mut StdRng, per_class: usize) -> Result<Block> {
    let mut block = Block::new(GroundMetric::euclidean(2));
    for i in 0..2 * per_class {
        let label = 1 + i % 2;
        let cx = if label == 1 { -2.0 } else { 2.0 };
        let n = rng.gen_range(2..6);
        let coords: Vec<f64> = (0..n)
            .flat_map(|_| [cx + rng.gen_range(-1.5..1.5), rng.gen_range(-1.5..1.5)])
            .collect();
        let weights: Vec<f64> = (0..n).map(|_| rng.gen_range(0.2..1.0)).collect();
        block.push_points(&coords, &weights, Some(label))?;
    }
    Ok(block)
}

fn load_params() -> Result<MlBadmmParams> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| D2Error::invalid_parameter("params", format!("{path}: {e}")))?;
            MlBadmmParams::from_json(&json)
        }
        None => Ok(MlBadmmParams::default()
            .with_max_iter(8)
            .with_badmm_iter(30)
            .with_beta(0.5)),
    }
}

fn run() -> Result<()> {
    let params = load_params()?;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let train = synthetic(&mut rng, 40)?;
    let validation = synthetic(&mut rng, 10)?;
    info!(elements = train.size(), supports = train.col(), "generated training data");

    let template = SoftmaxRegression::new(3, 2);
    let workers = LocalGroup::new(WORLD)?;
    let results: Vec<Result<(Vec<EpochReport>, Learner<SoftmaxRegression>)>> = thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                let (train, validation, params, template) = (&train, &validation, &params, &template);
                s.spawn(move || -> Result<(Vec<EpochReport>, Learner<SoftmaxRegression>)> {
                    let shard = train.shard(w.rank(), WORLD)?;
                    let mut learner = Learner::new(vec![template.clone(); 4])?;
                    let reports = ml_badmm(&shard, &mut learner, params, &[validation], &w)?;
                    Ok((reports, learner))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(D2Error::collective("worker panicked"))))
            .collect()
    });

    let mut results = results.into_iter().collect::<Result<Vec<_>>>()?;
    let (reports, learner) = results.swap_remove(0);
    if let Some(last) = reports.last() {
        println!("{}", serde_json::to_string_pretty(last).unwrap_or_default());
    }

    let query = validation.get(0);
    let (neighbors, stats) = knn_pruned(5, &query, &train)?;
    info!(exact = stats.exact, pruned = stats.pruned, "nearest neighbors of validation element 0");
    for n in &neighbors {
        println!("  #{:<3} label {:?} emd {:.4}", n.index, train.labels()[n.index], n.distance);
    }

    let mut proportions = Vec::new();
    predict_voting(&validation, &learner, &SingleProcess, Some(&mut proportions))?;
    println!("class mass of validation element 0: {:?}", &proportions[..learner.num_classes()]);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}
