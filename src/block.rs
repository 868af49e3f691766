//! Column-oriented storage of discrete distributions.
//!
//! A [`Block`] owns the concatenated supports, weights and labels of many
//! elements plus a prefix-sum offset table. An [`Element`] is a borrowed view
//! into one row of that storage and never outlives its block.

use crate::collective::Collective;
use crate::error::{D2Error, Result};
use crate::metric::{GroundMetric, StorageMode, Supports};
use std::ops::Range;

/// Tolerance of the weight-sum invariant.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// One discrete distribution: supports paired with weights, plus a label.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Element<'a> {
    pub supports: Supports<'a>,
    pub weights: &'a [f64],
    pub label: Option<usize>,
}

impl<'a> Element<'a> {
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum SupportStore {
    Points(Vec<f64>),
    Indices(Vec<usize>),
}

/// Contiguous storage for elements sharing one ground metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    metric: GroundMetric,
    supports: SupportStore,
    weights: Vec<f64>,
    offsets: Vec<usize>,
    labels: Vec<Option<usize>>,
}

/// Validate and normalise one element's weights onto the simplex.
fn simplex_weights(weights: &[f64]) -> Result<Vec<f64>> {
    if weights.is_empty() {
        return Err(D2Error::empty_input("element with zero length"));
    }
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(D2Error::invalid_weights(format!(
            "weight {w} is negative or non-finite"
        )));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(D2Error::invalid_weights("element carries no mass"));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

impl Block {
    pub fn new(metric: GroundMetric) -> Self {
        let supports = match metric.storage() {
            StorageMode::Dense => SupportStore::Points(Vec::new()),
            StorageMode::Indexed => SupportStore::Indices(Vec::new()),
        };
        Self {
            metric,
            supports,
            weights: Vec::new(),
            offsets: vec![0],
            labels: Vec::new(),
        }
    }

    /// Append an element whose supports are raw coordinates.
    pub fn push_points(&mut self, coords: &[f64], weights: &[f64], label: Option<usize>) -> Result<()> {
        let dim = self.metric.dim();
        let SupportStore::Points(store) = &mut self.supports else {
            return Err(D2Error::invalid_parameter(
                "supports",
                format!("{} blocks store indices, not coordinates", self.metric.name()),
            ));
        };
        if coords.len() != weights.len() * dim {
            return Err(D2Error::dimension_mismatch(weights.len() * dim, coords.len()));
        }
        let weights = simplex_weights(weights)?;
        store.extend_from_slice(coords);
        self.finish_push(weights, label);
        Ok(())
    }

    /// Append an element whose supports index into the metric's metadata.
    pub fn push_indexed(&mut self, indices: &[usize], weights: &[f64], label: Option<usize>) -> Result<()> {
        if indices.len() != weights.len() {
            return Err(D2Error::dimension_mismatch(weights.len(), indices.len()));
        }
        for &ix in indices {
            self.metric.check_index(ix)?;
        }
        if let GroundMetric::Histogram(bins) = &self.metric {
            let dense = indices.len() == bins.len() && indices.iter().enumerate().all(|(k, &ix)| k == ix);
            if !dense {
                return Err(D2Error::invalid_parameter(
                    "supports",
                    "dense histograms must list every bin in order",
                ));
            }
        }
        let SupportStore::Indices(store) = &mut self.supports else {
            return Err(D2Error::invalid_parameter(
                "supports",
                "euclidean blocks store coordinates, not indices",
            ));
        };
        let weights = simplex_weights(weights)?;
        store.extend_from_slice(indices);
        self.finish_push(weights, label);
        Ok(())
    }

    /// Append a histogram given as one mass per bin. Sparse histograms keep
    /// the non-zero bins only.
    pub fn push_histogram(&mut self, bins: &[f64], label: Option<usize>) -> Result<()> {
        match &self.metric {
            GroundMetric::Histogram(_) => {
                let indices: Vec<usize> = (0..bins.len()).collect();
                self.push_indexed(&indices, bins, label)
            }
            GroundMetric::SparseHistogram(_) => {
                let (indices, weights): (Vec<usize>, Vec<f64>) = bins
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| **w != 0.0)
                    .map(|(ix, &w)| (ix, w))
                    .unzip();
                self.push_indexed(&indices, &weights, label)
            }
            other => Err(D2Error::invalid_parameter(
                "metric",
                format!("{} blocks do not hold histograms", other.name()),
            )),
        }
    }

    fn finish_push(&mut self, weights: Vec<f64>, label: Option<usize>) {
        self.weights.extend(weights);
        self.offsets.push(self.weights.len());
        self.labels.push(label);
    }

    pub fn metric(&self) -> &GroundMetric {
        &self.metric
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.labels.len()
    }

    /// Total number of support points across all elements.
    pub fn col(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Column range of element `i`.
    pub fn span(&self, i: usize) -> Range<usize> {
        self.offsets[i]..self.offsets[i + 1]
    }

    /// Prefix-sum offsets, `size() + 1` entries.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Supports of every element, concatenated.
    pub fn supports(&self) -> Supports<'_> {
        match &self.supports {
            SupportStore::Points(coords) => Supports::Points {
                dim: self.metric.dim(),
                coords,
            },
            SupportStore::Indices(ix) => Supports::Indices(ix),
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn labels(&self) -> &[Option<usize>] {
        &self.labels
    }

    pub fn get(&self, i: usize) -> Element<'_> {
        let span = self.span(i);
        Element {
            supports: self.supports().slice(span.clone()),
            weights: &self.weights[span],
            label: self.labels[i],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Element<'_>> + '_ {
        (0..self.size()).map(move |i| self.get(i))
    }

    /// Label of the element owning each support point.
    pub fn support_labels(&self) -> Vec<Option<usize>> {
        let mut out = Vec::with_capacity(self.col());
        for (i, label) in self.labels.iter().enumerate() {
            out.extend(std::iter::repeat(*label).take(self.span(i).len()));
        }
        out
    }

    /// Row-major derived coordinates of every support point.
    pub fn embedded_supports(&self) -> Vec<f64> {
        let supports = self.supports();
        let mut out = Vec::with_capacity(self.col() * self.metric.dim());
        for k in 0..self.col() {
            out.extend_from_slice(&self.metric.coordinate(supports, k));
        }
        out
    }

    /// New block holding the listed elements, in the listed order.
    pub fn subset(&self, indices: &[usize]) -> Result<Block> {
        let mut out = Block::new(self.metric.clone());
        for &i in indices {
            if i >= self.size() {
                return Err(D2Error::invalid_parameter(
                    "element index",
                    format!("{i} is outside a block of {}", self.size()),
                ));
            }
            let e = self.get(i);
            match e.supports {
                Supports::Points { coords, .. } => out.push_points(coords, e.weights, e.label)?,
                Supports::Indices(ix) => out.push_indexed(ix, e.weights, e.label)?,
            }
        }
        Ok(out)
    }

    /// Contiguous row-wise shard `rank` of `world`.
    pub fn shard(&self, rank: usize, world: usize) -> Result<Block> {
        let range = shard_range(self.size(), rank, world)?;
        self.subset(&range.collect::<Vec<_>>())
    }

    /// Check that every element's weights sum to one.
    pub fn check_simplex(&self) -> Result<()> {
        for (i, e) in self.iter().enumerate() {
            let total = e.total_weight();
            if (total - 1.0).abs() > WEIGHT_TOLERANCE {
                return Err(D2Error::invalid_weights(format!(
                    "element {i} sums to {total}"
                )));
            }
        }
        Ok(())
    }
}

fn shard_range(size: usize, rank: usize, world: usize) -> Result<Range<usize>> {
    if world == 0 || rank >= world {
        return Err(D2Error::invalid_parameter(
            "rank",
            format!("rank {rank} is outside a world of {world}"),
        ));
    }
    let base = size / world;
    let extra = size % world;
    let start = rank * base + rank.min(extra);
    let len = base + usize::from(rank < extra);
    Ok(start..start + len)
}

/// Blocks sharing a row correspondence: row `i` of every phase describes
/// the same example.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiPhaseBlock {
    phases: Vec<Block>,
}

impl MultiPhaseBlock {
    pub fn new(phases: Vec<Block>) -> Result<Self> {
        if phases.is_empty() {
            return Err(D2Error::empty_input("multi-phase collection without phases"));
        }
        let out = Self { phases };
        out.check_alignment()?;
        Ok(out)
    }

    pub fn check_alignment(&self) -> Result<()> {
        let expected = self.phases[0].size();
        for (phase, block) in self.phases.iter().enumerate().skip(1) {
            if block.size() != expected {
                return Err(D2Error::PhaseMismatch {
                    phase,
                    expected,
                    got: block.size(),
                });
            }
        }
        Ok(())
    }

    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn size(&self) -> usize {
        self.phases[0].size()
    }

    pub fn phase(&self, p: usize) -> Option<&Block> {
        self.phases.get(p)
    }

    pub fn phases(&self) -> &[Block] {
        &self.phases
    }

    /// Phase `p`, after checking that every phase is row-aligned.
    pub fn aligned_phase(&self, p: usize) -> Result<&Block> {
        self.check_alignment()?;
        self.phases
            .get(p)
            .ok_or_else(|| D2Error::invalid_parameter("phase", format!("{p} >= {}", self.phases.len())))
    }

    /// Row `i` across all phases.
    pub fn row(&self, i: usize) -> Result<Vec<Element<'_>>> {
        self.check_alignment()?;
        if i >= self.size() {
            return Err(D2Error::invalid_parameter(
                "row",
                format!("{i} is outside a collection of {}", self.size()),
            ));
        }
        Ok(self.phases.iter().map(|b| b.get(i)).collect())
    }

    pub fn shard(&self, rank: usize, world: usize) -> Result<MultiPhaseBlock> {
        let phases = self
            .phases
            .iter()
            .map(|b| b.shard(rank, world))
            .collect::<Result<Vec<_>>>()?;
        MultiPhaseBlock::new(phases)
    }
}

/// A worker's local partition of a row-sharded multi-phase collection.
///
/// Global counts are reduced on demand and never cached.
pub struct DistributedMultiPhase<'c> {
    local: MultiPhaseBlock,
    comm: &'c dyn Collective,
}

impl<'c> DistributedMultiPhase<'c> {
    pub fn new(local: MultiPhaseBlock, comm: &'c dyn Collective) -> Self {
        Self { local, comm }
    }

    pub fn local(&self) -> &MultiPhaseBlock {
        &self.local
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Element count summed over all workers.
    pub fn global_size(&self) -> Result<usize> {
        self.local.check_alignment()?;
        let total = self.comm.allreduce_scalar(self.local.size() as f64)?;
        Ok(total as usize)
    }

    /// Support-point count of `phase` summed over all workers.
    pub fn global_cols(&self, phase: usize) -> Result<usize> {
        let block = self.local.aligned_phase(phase)?;
        let total = self.comm.allreduce_scalar(block.col() as f64)?;
        Ok(total as usize)
    }
}
