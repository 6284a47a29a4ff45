//! Probabilistic regression backends for learned state derivatives.
//!
//! A backend maps a (normalized) state to the mean and covariance of the state derivative at
//! that point. Every backend satisfies [RegressionBackend], so the transition model and the
//! filter never depend on which regression surface sits underneath:
//!
//! - [IndependentGp]: one exact Gaussian process per output dimension. Reports a column-shaped
//!   mean and per-dimension variances.
//! - [MultitaskGp]: a single coregionalized Gaussian process over all outputs. Reports a
//!   row-shaped mean and a full covariance matrix.
//!
//! Backends are constructed unfitted and become queryable after [RegressionBackend::fit].

pub mod independent;
pub mod kernel;
pub mod multitask;
pub mod optimizer;

pub use independent::IndependentGp;
pub use kernel::{KernelHyperparameters, SquaredExponential};
pub use multitask::MultitaskGp;
pub use optimizer::Adam;

use crate::error::{FilterError, Result};
use crate::training::TrainingSet;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Predictive covariance of the state derivative, in whatever form the backend produces
#[derive(Clone, Debug, PartialEq)]
pub enum PredictiveCovariance {
    /// Full n×n covariance
    Full(DMatrix<f64>),
    /// Per-dimension variances only; cross-covariances are zero
    Diagonal(DVector<f64>),
}
impl PredictiveCovariance {
    /// Number of state dimensions covered
    pub fn dimension(&self) -> usize {
        match self {
            PredictiveCovariance::Full(m) => m.nrows(),
            PredictiveCovariance::Diagonal(v) => v.len(),
        }
    }
}

/// Output of a single backend query
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Mean derivative. Backends may shape this as 1×n or n×1.
    pub mean: DMatrix<f64>,
    pub covariance: PredictiveCovariance,
}

/// Controls for the iterative fitting step
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Iteration budget
    pub iterations: usize,
    /// Optimizer step size
    pub learning_rate: f64,
    /// Log the loss at every iteration
    pub verbose: bool,
}
impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            iterations: 50,
            learning_rate: 0.1,
            verbose: false,
        }
    }
}

/// Summary of a completed fit
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitReport {
    pub iterations: usize,
    /// Negative log marginal likelihood per sample at the final hyperparameters
    pub final_loss: f64,
}

/// Which backend to build
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Independent,
    Multitask,
}

/// Capability shared by every regression surface
pub trait RegressionBackend {
    /// Dimension n of both the query state and the predicted derivative
    fn dimension(&self) -> usize;
    fn is_fitted(&self) -> bool;
    /// Fit the backend to (already normalized) training data.
    fn fit(&mut self, data: &TrainingSet, options: &FitOptions) -> Result<FitReport>;
    /// Predictive mean and covariance of the derivative at `query`.
    ///
    /// # Errors
    /// * `ModelNotFitted` before [Self::fit] has succeeded.
    /// * `ShapeMismatch` if `query` does not have [Self::dimension] entries.
    fn predict(&self, query: &DVector<f64>) -> Result<Prediction>;
    /// Mean only. Backends can override this to skip the variance computation.
    fn predict_mean(&self, query: &DVector<f64>) -> Result<DMatrix<f64>> {
        Ok(self.predict(query)?.mean)
    }
    /// Covariance only
    fn predict_covariance(&self, query: &DVector<f64>) -> Result<PredictiveCovariance> {
        Ok(self.predict(query)?.covariance)
    }
}

impl<B: RegressionBackend + ?Sized> RegressionBackend for Box<B> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
    fn is_fitted(&self) -> bool {
        (**self).is_fitted()
    }
    fn fit(&mut self, data: &TrainingSet, options: &FitOptions) -> Result<FitReport> {
        (**self).fit(data, options)
    }
    fn predict(&self, query: &DVector<f64>) -> Result<Prediction> {
        (**self).predict(query)
    }
    fn predict_mean(&self, query: &DVector<f64>) -> Result<DMatrix<f64>> {
        (**self).predict_mean(query)
    }
    fn predict_covariance(&self, query: &DVector<f64>) -> Result<PredictiveCovariance> {
        (**self).predict_covariance(query)
    }
}

/// Build an unfitted backend of the requested kind for an n-dimensional state.
pub fn build_backend(kind: BackendKind, dimension: usize) -> Box<dyn RegressionBackend> {
    match kind {
        BackendKind::Independent => Box::new(IndependentGp::new(dimension)),
        BackendKind::Multitask => Box::new(MultitaskGp::new(dimension)),
    }
}

/// Shared guard for training data handed to a backend
pub(crate) fn check_training(dimension: usize, data: &TrainingSet) -> Result<()> {
    if data.dimension() != dimension {
        return Err(FilterError::shape(
            "training data dimension",
            dimension,
            data.dimension(),
        ));
    }
    Ok(())
}

/// Shared guard for query vectors
pub(crate) fn check_query(dimension: usize, query: &DVector<f64>) -> Result<()> {
    if query.len() != dimension {
        return Err(FilterError::shape("backend query", dimension, query.len()));
    }
    Ok(())
}
