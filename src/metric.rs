//! Ground-metric backends.
//!
//! A ground metric turns the stored support points of two elements into a
//! pairwise cost matrix. Every backend derives a coordinate vector from what
//! is stored (raw coordinates, a word id, an n-gram id, a histogram bin) and
//! then applies the squared Euclidean distance:
//!
//! | Variant | Stored support | Metadata |
//! |---|---|---|
//! | `Euclidean` | `dim` coordinates | none |
//! | `WordVec` | word id | embedding table |
//! | `NGram` | n-gram id, base `alphabet.len()` | per-symbol embedding |
//! | `Histogram` | bin id, every bin present | bin coordinates |
//! | `SparseHistogram` | bin id, non-zero bins only | bin coordinates |
//!
//! The set of variants is closed, so an unknown backend cannot be expressed.

use crate::error::{D2Error, Result};
use std::borrow::Cow;
use std::ops::Range;

/// Borrowed support points of one element (or of a whole block).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Supports<'a> {
    /// Row-major coordinates, `dim` values per support point.
    Points { dim: usize, coords: &'a [f64] },
    /// Indices into the metric's metadata table.
    Indices(&'a [usize]),
}

impl<'a> Supports<'a> {
    /// Number of support points.
    pub fn len(&self) -> usize {
        match self {
            Supports::Points { dim, coords } => {
                if *dim == 0 {
                    0
                } else {
                    coords.len() / dim
                }
            }
            Supports::Indices(ix) => ix.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-range of support points.
    pub fn slice(&self, range: Range<usize>) -> Supports<'a> {
        match *self {
            Supports::Points { dim, coords } => Supports::Points {
                dim,
                coords: &coords[range.start * dim..range.end * dim],
            },
            Supports::Indices(ix) => Supports::Indices(&ix[range]),
        }
    }

    /// Stored index of support `k`, if this is an indexed support.
    pub fn index(&self, k: usize) -> Option<usize> {
        match self {
            Supports::Points { .. } => None,
            Supports::Indices(ix) => ix.get(k).copied(),
        }
    }
}

/// Lookup table mapping an index to a coordinate vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    dim: usize,
    rows: Vec<f64>,
}

impl Embedding {
    /// Build a table from row-major values, `dim` values per row.
    pub fn new(dim: usize, rows: Vec<f64>) -> Result<Self> {
        if dim == 0 {
            return Err(D2Error::invalid_parameter("dim", "must be > 0"));
        }
        if rows.is_empty() {
            return Err(D2Error::empty_input("embedding table"));
        }
        if rows.len() % dim != 0 {
            return Err(D2Error::dimension_mismatch(
                (rows.len() / dim + 1) * dim,
                rows.len(),
            ));
        }
        if rows.iter().any(|v| !v.is_finite()) {
            return Err(D2Error::numerical_instability(
                "embedding table contains non-finite values",
            ));
        }
        Ok(Self { dim, rows })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != dim) {
            return Err(D2Error::dimension_mismatch(dim, bad.len()));
        }
        Self::new(dim, rows.concat())
    }

    /// Evenly spaced one-dimensional bin coordinates `0, 1, .., bins-1`.
    pub fn line(bins: usize) -> Result<Self> {
        Self::new(1, (0..bins).map(|i| i as f64).collect())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.rows[i * self.dim..(i + 1) * self.dim]
    }
}

/// Storage mode implied by a ground metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Supports are stored as coordinates.
    Dense,
    /// Supports are stored as indices into metadata.
    Indexed,
}

/// The ground metric of a block, carrying its metadata payload.
#[derive(Clone, Debug, PartialEq)]
pub enum GroundMetric {
    Euclidean { dim: usize },
    WordVec(Embedding),
    NGram { order: usize, alphabet: Embedding },
    Histogram(Embedding),
    SparseHistogram(Embedding),
}

impl GroundMetric {
    pub fn euclidean(dim: usize) -> Self {
        GroundMetric::Euclidean { dim }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GroundMetric::Euclidean { .. } => "euclidean",
            GroundMetric::WordVec(_) => "wordvec",
            GroundMetric::NGram { .. } => "ngram",
            GroundMetric::Histogram(_) => "histogram",
            GroundMetric::SparseHistogram(_) => "sparse_histogram",
        }
    }

    /// Dimension of the derived coordinates.
    pub fn dim(&self) -> usize {
        match self {
            GroundMetric::Euclidean { dim } => *dim,
            GroundMetric::WordVec(table)
            | GroundMetric::Histogram(table)
            | GroundMetric::SparseHistogram(table) => table.dim(),
            GroundMetric::NGram { order, alphabet } => order * alphabet.dim(),
        }
    }

    pub fn storage(&self) -> StorageMode {
        match self {
            GroundMetric::Euclidean { .. } => StorageMode::Dense,
            _ => StorageMode::Indexed,
        }
    }

    /// Number of valid support indices, `None` for coordinate storage.
    pub fn vocabulary(&self) -> Option<usize> {
        match self {
            GroundMetric::Euclidean { .. } => None,
            GroundMetric::WordVec(table)
            | GroundMetric::Histogram(table)
            | GroundMetric::SparseHistogram(table) => Some(table.len()),
            GroundMetric::NGram { order, alphabet } => {
                u32::try_from(*order)
                    .ok()
                    .and_then(|o| alphabet.len().checked_pow(o))
            }
        }
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        match self.vocabulary() {
            Some(vocab) if index < vocab => Ok(()),
            Some(vocab) => Err(D2Error::invalid_parameter(
                "support index",
                format!("{index} is outside the {} vocabulary of {vocab}", self.name()),
            )),
            None => Err(D2Error::invalid_parameter(
                "support index",
                "euclidean supports are stored as coordinates",
            )),
        }
    }

    /// Coordinate of a stored index.
    pub fn index_coordinate(&self, index: usize) -> Cow<'_, [f64]> {
        match self {
            GroundMetric::Euclidean { .. } => Cow::Borrowed(&[]),
            GroundMetric::WordVec(table)
            | GroundMetric::Histogram(table)
            | GroundMetric::SparseHistogram(table) => Cow::Borrowed(table.row(index)),
            GroundMetric::NGram { order, alphabet } => {
                let base = alphabet.len();
                let mut rest = index;
                let mut coord = Vec::with_capacity(order * alphabet.dim());
                for _ in 0..*order {
                    coord.extend_from_slice(alphabet.row(rest % base));
                    rest /= base;
                }
                Cow::Owned(coord)
            }
        }
    }

    /// Coordinate of support `k`.
    pub fn coordinate<'a>(&'a self, supports: Supports<'a>, k: usize) -> Cow<'a, [f64]> {
        match supports {
            Supports::Points { dim, coords } => Cow::Borrowed(&coords[k * dim..(k + 1) * dim]),
            Supports::Indices(ix) => self.index_coordinate(ix[k]),
        }
    }

    /// Weighted mean of the support coordinates.
    pub fn centroid(&self, supports: Supports<'_>, weights: &[f64]) -> Vec<f64> {
        let mut centroid = vec![0.0; self.dim()];
        for (k, &w) in weights.iter().enumerate().take(supports.len()) {
            let coord = self.coordinate(supports, k);
            for (c, x) in centroid.iter_mut().zip(coord.iter()) {
                *c += w * x;
            }
        }
        centroid
    }
}

/// Squared Euclidean distance, the vector distance under every backend.
#[inline]
pub fn squared_euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Dense row-major cost matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct CostMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl CostMatrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(D2Error::dimension_mismatch(rows * cols, data.len()));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    pub fn transpose(&self) -> CostMatrix {
        CostMatrix::from_fn(self.cols, self.rows, |i, j| self.get(j, i))
    }

    /// Minimum of every row.
    pub fn row_minima(&self) -> Vec<f64> {
        self.data
            .chunks(self.cols.max(1))
            .take(self.rows)
            .map(|row| row.iter().copied().fold(f64::INFINITY, f64::min))
            .collect()
    }

    /// Minimum of every column.
    pub fn col_minima(&self) -> Vec<f64> {
        let mut minima = vec![f64::INFINITY; self.cols];
        for row in self.data.chunks(self.cols.max(1)).take(self.rows) {
            for (m, &c) in minima.iter_mut().zip(row) {
                *m = m.min(c);
            }
        }
        minima
    }
}

/// Pairwise ground costs between the supports of `a` (rows) and `b` (columns).
pub fn pdist2(metric: &GroundMetric, a: Supports<'_>, b: Supports<'_>) -> CostMatrix {
    let coords_b: Vec<Cow<'_, [f64]>> = (0..b.len()).map(|j| metric.coordinate(b, j)).collect();
    let mut data = Vec::with_capacity(a.len() * b.len());
    for i in 0..a.len() {
        let ca = metric.coordinate(a, i);
        data.extend(coords_b.iter().map(|cb| squared_euclidean(&ca, cb)));
    }
    CostMatrix {
        rows: a.len(),
        cols: b.len(),
        data,
    }
}
