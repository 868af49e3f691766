/// Exact EMD checks against values that can be worked out by hand,
/// across every ground-metric backend.

use d2ml::emd_1d::emd_1d_exact;
use d2ml::*;

#[test]
fn test_three_bin_transport_matches_cdf_formula() {
    println!("\n=== EMD: p=[.5,.25,.25] vs q=[.25,.25,.5], cost |i-j| ===");

    let p = [0.5, 0.25, 0.25];
    let q = [0.25, 0.25, 0.5];
    let cost = CostMatrix::from_fn(3, 3, |i, j| (i as f64 - j as f64).abs());

    let plan = transport(&p, &q, &cost).unwrap();
    let closed_form = emd_1d_exact(&p, &q).unwrap();

    println!("transport = {}, CDF sum = {}", plan.cost, closed_form);
    assert!((plan.cost - 0.5).abs() < 1e-12);
    assert!((closed_form - 0.5).abs() < 1e-12);

    // the plan is a coupling of p and q
    for i in 0..3 {
        let row: f64 = (0..3).map(|j| plan.get(i, j)).sum();
        let col: f64 = (0..3).map(|j| plan.get(j, i)).sum();
        assert!((row - p[i]).abs() < 1e-12);
        assert!((col - q[i]).abs() < 1e-12);
    }
    println!("✓ PASSED");
}

#[test]
fn test_dense_histogram_block() {
    println!("\n=== EMD: dense histogram backend ===");

    // squared cost on a line: the monotone coupling still moves
    // 0.25 by one bin twice
    let mut block = Block::new(GroundMetric::Histogram(Embedding::line(3).unwrap()));
    block.push_histogram(&[0.5, 0.25, 0.25], Some(1)).unwrap();
    block.push_histogram(&[0.25, 0.25, 0.5], Some(2)).unwrap();

    let d = emd(&block, &block.get(0), &block.get(1)).unwrap();
    println!("EMD = {}", d);
    assert!((d - 0.5).abs() < 1e-12);
    println!("✓ PASSED");
}

#[test]
fn test_sparse_histogram_matches_dense() {
    println!("\n=== EMD: sparse and dense histograms agree ===");

    let bins = [0.0, 0.5, 0.0, 0.0, 0.5];
    let other = [0.25, 0.0, 0.75, 0.0, 0.0];

    let mut dense = Block::new(GroundMetric::Histogram(Embedding::line(5).unwrap()));
    dense.push_histogram(&bins, None).unwrap();
    dense.push_histogram(&other, None).unwrap();

    let mut sparse = Block::new(GroundMetric::SparseHistogram(Embedding::line(5).unwrap()));
    sparse.push_histogram(&bins, None).unwrap();
    sparse.push_histogram(&other, None).unwrap();
    assert_eq!(sparse.col(), 4);
    assert_eq!(dense.col(), 10);

    let d_dense = emd(&dense, &dense.get(0), &dense.get(1)).unwrap();
    let d_sparse = emd(&sparse, &sparse.get(0), &sparse.get(1)).unwrap();
    println!("dense = {}, sparse = {}", d_dense, d_sparse);
    assert!((d_dense - d_sparse).abs() < 1e-9);
    println!("✓ PASSED");
}

#[test]
fn test_euclidean_point_masses() {
    println!("\n=== EMD: point masses in 2-D ===");

    let mut block = Block::new(GroundMetric::euclidean(2));
    block.push_points(&[0.0, 0.0], &[1.0], None).unwrap();
    block.push_points(&[3.0, 4.0], &[1.0], None).unwrap();

    let d = emd(&block, &block.get(0), &block.get(1)).unwrap();
    println!("EMD = {} (squared distance 25)", d);
    assert!((d - 25.0).abs() < 1e-12);
    println!("✓ PASSED");
}

#[test]
fn test_word_vectors_resolve_through_embedding() {
    println!("\n=== EMD: word-vector backend ===");

    let table = Embedding::from_rows(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap();
    let mut block = Block::new(GroundMetric::WordVec(table));
    block.push_indexed(&[0, 1], &[1.0, 1.0], None).unwrap();
    block.push_indexed(&[2], &[1.0], None).unwrap();

    // half the mass travels 4, the other half 5
    let d = emd(&block, &block.get(0), &block.get(1)).unwrap();
    println!("EMD = {}", d);
    assert!((d - 4.5).abs() < 1e-12);
    assert!(block.push_indexed(&[3], &[1.0], None).is_err());
    println!("✓ PASSED");
}

#[test]
fn test_ngram_ids_decode_to_symbol_pairs() {
    println!("\n=== EMD: n-gram backend ===");

    let alphabet = Embedding::from_rows(&[vec![0.0], vec![1.0], vec![3.0]]).unwrap();
    let metric = GroundMetric::NGram { order: 2, alphabet };
    assert_eq!(metric.vocabulary(), Some(9));
    assert_eq!(metric.dim(), 2);

    // id 5 = 2 + 1*3 -> symbols (2, 1) -> [3, 1]
    assert_eq!(metric.index_coordinate(5).to_vec(), vec![3.0, 1.0]);

    let mut block = Block::new(metric);
    block.push_indexed(&[0], &[1.0], None).unwrap();
    block.push_indexed(&[5], &[1.0], None).unwrap();
    let d = emd(&block, &block.get(0), &block.get(1)).unwrap();
    assert!((d - 10.0).abs() < 1e-12);
    println!("✓ PASSED");
}

#[test]
fn test_cached_cost_reuse() {
    println!("\n=== EMD: cost matrix reuse ===");

    let mut block = Block::new(GroundMetric::euclidean(1));
    block.push_points(&[0.0, 1.0, 2.0], &[0.2, 0.3, 0.5], None).unwrap();
    block.push_points(&[0.5, 2.5], &[0.6, 0.4], None).unwrap();
    let (a, b) = (block.get(0), block.get(1));

    let cost = pdist2(block.metric(), a.supports, b.supports);
    let first = emd_with_cost(&a, &b, &cost).unwrap();
    let second = emd_with_cost(&a, &b, &cost).unwrap();
    assert_eq!(first.cost, second.cost);
    assert!((first.cost - emd(&block, &a, &b).unwrap()).abs() < 1e-12);

    let all = emd_to_block(&a, &block).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].abs() < 1e-12);
    assert!((all[1] - first.cost).abs() < 1e-12);
    println!("✓ PASSED");
}
