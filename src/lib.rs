//! # d2ml: Earth Mover's Distance and Marriage Learning
//!
//! Exact EMD between discrete distributions, lower-bound pruned nearest
//! neighbor search, and a distributed trainer that learns a coupling between
//! data and a classifier ensemble by Bregman ADMM.
//!
//! ## Data Model
//!
//! A discrete distribution (an *element*) is a list of support points with
//! non-negative weights summing to one. Elements of one kind are stored
//! column-wise in a [`Block`]: concatenated supports, concatenated weights
//! and a prefix-sum offset table. Support points are either stored
//! coordinates or indices resolved through the block's [`GroundMetric`]:
//!
//! - `Euclidean`: plain vectors
//! - `WordVec`: word ids into an embedding table
//! - `NGram`: n-gram ids decoded into concatenated symbol vectors
//! - `Histogram` / `SparseHistogram`: bin ids into bin coordinates
//!
//! Every variant compares coordinates with the squared Euclidean distance.
//!
//! ## Distances
//!
//! - [`emd::transport`]: transportation simplex, exact to machine precision,
//!   returns the plan and the dual potentials
//! - [`bounds`]: `v0 ≤ v1 ≤ EMD`, the centroid and nearest-support bounds
//! - [`knn`]: linear and pruned k-NN, identical results
//!
//! ## Marriage Learning
//!
//! [`ml_badmm`] trains a [`Learner`] in place. Each epoch:
//!
//! 1. Adjusted cost `C_kj = F_j(x_k, y_k) − β · F_j(x_k, 0)`
//! 2. Penalty adaptation and rescaling by the global mean `|C|`
//! 3. BADMM on every local element
//! 4. Classifier refit from the coupling, synchronised from each owner
//! 5. Winner-take-all and voting accuracy, reduced over all ranks
//!
//! Workers run the same program and communicate only through a
//! [`Collective`]. [`LocalGroup`] runs a group of workers as threads inside
//! one process and detects out-of-order collectives.

pub mod error;
pub mod config;
pub mod metric;
pub mod block;
pub mod emd;
pub mod emd_1d;
pub mod bounds;
pub mod knn;
pub mod collective;
pub mod classifier;
pub mod badmm;
pub mod predict;
pub mod marriage;

pub use error::{D2Error, Result};
pub use config::{FitFailurePolicy, MlBadmmParams, SampleStrategy};
pub use metric::{pdist2, CostMatrix, Embedding, GroundMetric, Supports};
pub use block::{Block, DistributedMultiPhase, Element, MultiPhaseBlock};
pub use emd::{emd, emd_to_block, emd_to_collection, emd_to_phase, emd_with_cost, transport, TransportPlan};
pub use bounds::{lower_bound_v0, lower_bound_v1};
pub use knn::{knn_linear, knn_linear_phase, knn_pruned, knn_pruned_phase, Neighbor, PruneStats};
pub use collective::{Collective, LocalGroup, LocalWorker, SingleProcess};
pub use classifier::{Classifier, Learner, Ownership, SoftmaxConfig, SoftmaxRegression, TrainingSet};
pub use badmm::{emd_badmm, BadmmCache, Residuals};
pub use predict::{predict_voting, predict_winner_take_all, Accuracy};
pub use marriage::{ml_badmm, EpochReport};
