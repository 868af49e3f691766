//! Error types for d2ml

use thiserror::Error;

/// Result type alias for d2ml operations
pub type Result<T> = std::result::Result<T, D2Error>;

/// Errors raised by the distance kernels, the collective runtime and the
/// marriage-learning loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum D2Error {
    /// Dimension mismatch between inputs
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension
        expected: usize,
        /// Actual dimension received
        got: usize,
    },

    /// Empty input where non-empty was required
    #[error("Empty input: {context}")]
    EmptyInput {
        /// What was empty
        context: String,
    },

    /// Invalid parameter value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Reason why it's invalid
        reason: String,
    },

    /// Weights that are negative, non-finite or carry no mass
    #[error("Invalid weights: {reason}")]
    InvalidWeights {
        /// Description of the violation
        reason: String,
    },

    /// Phases of a multi-phase collection disagree on the element count
    #[error("Phase {phase} holds {got} elements, expected {expected}")]
    PhaseMismatch {
        /// Offending phase
        phase: usize,
        /// Element count of phase 0
        expected: usize,
        /// Element count of the offending phase
        got: usize,
    },

    /// Element label outside the trainable class range
    #[error("Element {element} has label {label:?}, expected a class in 1..{num_classes}")]
    InvalidLabel {
        /// Local element index
        element: usize,
        /// Label found on the element
        label: Option<usize>,
        /// Number of classes of the learner (class 0 is background)
        num_classes: usize,
    },

    /// A classifier could not be fitted
    #[error("Classifier {index} failed to fit: {reason}")]
    FitFailure {
        /// Classifier index within the learner
        index: usize,
        /// Backend-specific reason
        reason: String,
    },

    /// Workers issued collectives in a different order
    #[error("Collective protocol mismatch on rank {rank}: expected {expected}, peer issued {got}")]
    ProtocolMismatch {
        /// Rank that detected the mismatch
        rank: usize,
        /// Fingerprint of this rank's call
        expected: String,
        /// Fingerprint of the first disagreeing peer call
        got: String,
    },

    /// Collective runtime failure (poisoned state, bad owner rank)
    #[error("Collective runtime failure: {message}")]
    Collective {
        /// Description of the failure
        message: String,
    },

    /// Another rank failed a precondition this rank passed
    #[error("A peer rank failed during {stage}")]
    PeerFailure {
        /// Stage at which the peers disagreed
        stage: String,
    },

    /// Numerical degeneracy that could not be guarded locally
    #[error("Numerical instability: {message}")]
    NumericalInstability {
        /// Description of the instability
        message: String,
    },

    /// Transportation simplex hit its pivot cap
    #[error("Transport solver stopped after {pivots} pivots without reaching optimality")]
    NotOptimal {
        /// Number of pivots performed
        pivots: usize,
    },
}

impl D2Error {
    /// Create a dimension mismatch error
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Create an empty input error
    pub fn empty_input(context: impl Into<String>) -> Self {
        Self::EmptyInput {
            context: context.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid weights error
    pub fn invalid_weights(reason: impl Into<String>) -> Self {
        Self::InvalidWeights {
            reason: reason.into(),
        }
    }

    /// Create a fit failure error
    pub fn fit_failure(index: usize, reason: impl Into<String>) -> Self {
        Self::FitFailure {
            index,
            reason: reason.into(),
        }
    }

    /// Create a collective runtime error
    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective {
            message: message.into(),
        }
    }

    /// Create a numerical instability error
    pub fn numerical_instability(message: impl Into<String>) -> Self {
        Self::NumericalInstability {
            message: message.into(),
        }
    }

    /// True for errors that every rank observes identically, so the caller
    /// can abort the whole job without further coordination.
    pub fn is_collective_safe(&self) -> bool {
        matches!(
            self,
            Self::ProtocolMismatch { .. }
                | Self::PeerFailure { .. }
                | Self::FitFailure { .. }
                | Self::InvalidParameter { .. }
        )
    }
}
