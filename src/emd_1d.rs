//! Closed-form EMD on the real line.
//!
//! With ground cost `|x_i − x_j|` on sorted positions, the optimal transport
//! cost is the area between the two cumulative distributions:
//!
//! ```text
//! EMD(a, b) = Σ_i |CDF_a(i) − CDF_b(i)| · (x_{i+1} − x_i)
//! ```
//!
//! This is O(n) and exact, which makes it the reference the general
//! transportation solver is checked against.

use crate::error::{D2Error, Result};

/// Exact EMD between two histograms over unit-spaced bins `0, 1, 2, ..`.
pub fn emd_1d_exact(a: &[f64], b: &[f64]) -> Result<f64> {
    let positions: Vec<f64> = (0..a.len()).map(|i| i as f64).collect();
    emd_1d(&positions, a, b)
}

/// Exact EMD between two histograms sharing sorted bin `positions`.
///
/// Both histograms are normalised to unit mass.
pub fn emd_1d(positions: &[f64], a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(D2Error::dimension_mismatch(a.len(), b.len()));
    }
    if positions.len() != a.len() {
        return Err(D2Error::dimension_mismatch(a.len(), positions.len()));
    }
    if a.is_empty() {
        return Err(D2Error::empty_input("histogram"));
    }
    if positions.windows(2).any(|w| w[1] < w[0]) {
        return Err(D2Error::invalid_parameter("positions", "must be sorted"));
    }
    let mass_a: f64 = a.iter().sum();
    let mass_b: f64 = b.iter().sum();
    if mass_a <= 0.0 || mass_b <= 0.0 {
        return Err(D2Error::invalid_weights("histogram carries no mass"));
    }

    let mut cdf_a = 0.0;
    let mut cdf_b = 0.0;
    let mut emd = 0.0;
    for i in 0..a.len() - 1 {
        cdf_a += a[i] / mass_a;
        cdf_b += b[i] / mass_b;
        emd += (cdf_a - cdf_b).abs() * (positions[i + 1] - positions[i]);
    }
    Ok(emd)
}
