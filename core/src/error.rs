//! Error types shared by the regression backends, the transition model, and the filter driver.
//!
//! Errors raised by a backend or a normalizer travel unmodified up to the driver. The only
//! wrapping that happens on the way is [FilterError::SigmaPoint], which records which sigma
//! point and which operation failed while keeping the original error as its `source`.

use crate::driver::CyclePhase;

use std::fmt::{self, Display};

/// The operation being evaluated on a sigma point when a cycle failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Propagating the sigma point through the learned dynamics
    Transition,
    /// Querying the learned process-noise covariance at the sigma point
    TransitionNoise,
}
impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Transition => write!(f, "transition"),
            Operation::TransitionNoise => write!(f, "transition noise"),
        }
    }
}

/// Errors produced by the learned-dynamics filtering stack
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// A regression backend was queried before `fit` ran
    #[error("regression model queried before it was fitted")]
    ModelNotFitted,

    /// Output or input dimensionality disagrees with the configured state dimension
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected size
        expected: usize,
        /// Actual size
        got: usize,
    },

    /// No usable square root could be produced, even after eigenvalue clipping
    #[error("matrix is not positive semi-definite: {0}")]
    NonPositiveSemiDefinite(String),

    /// A transform was applied with parameters fitted for a different dimension
    #[error("normalization parameters cover {expected} dimensions, value has {got}")]
    NormalizationParameter {
        /// Dimension the parameters were fitted on
        expected: usize,
        /// Dimension of the value being transformed
        got: usize,
    },

    /// Training data is empty or its two matrices disagree
    #[error("invalid training data: {0}")]
    InvalidTrainingData(String),

    /// A predict cycle failed while evaluating one sigma point
    #[error("{operation} failed at sigma point {index}: {source}")]
    SigmaPoint {
        /// Column index of the failing sigma point
        index: usize,
        /// What was being computed
        operation: Operation,
        /// The unmodified underlying error
        #[source]
        source: Box<FilterError>,
    },

    /// A measurement update was requested outside the predicted phase of a cycle
    #[error("measurement update needs a predicted belief, driver is {0}")]
    OutOfPhase(CyclePhase),
}
impl FilterError {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, got: usize) -> Self {
        FilterError::ShapeMismatch {
            context: context.into(),
            expected,
            got,
        }
    }
    pub(crate) fn at_sigma_point(self, index: usize, operation: Operation) -> Self {
        FilterError::SigmaPoint {
            index,
            operation,
            source: Box::new(self),
        }
    }
    /// The innermost error, with any sigma point context peeled off.
    pub fn root_cause(&self) -> &FilterError {
        match self {
            FilterError::SigmaPoint { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FilterError>;
