//! Learned state transition model.
//!
//! [GpStateSpaceModel] wraps a [RegressionBackend] trained on normalized `(state, derivative)`
//! pairs and exposes the two callables the filter needs:
//!
//! - `transition(x, dt)`: explicit forward-Euler step along the learned vector field,
//!   $x_{k+1} = x_k + \hat{\dot{x}}(x_k)\, \Delta t$
//! - `transition_noise(x)`: predictive covariance of the derivative at `x`, in raw units
//!
//! States are normalized with parameters fitted on the training states; backend outputs are
//! mapped back with parameters fitted on the training derivatives. Means go through the affine
//! inverse, covariances through the scale-only inverse (see [crate::normalize]).

use crate::backend::{FitOptions, FitReport, PredictiveCovariance, RegressionBackend};
use crate::error::{FilterError, Result};
use crate::normalize::{NormalizationKind, Normalizer};
use crate::training::TrainingSet;

use log::debug;
use nalgebra::{DMatrix, DVector, RowDVector};
use std::rc::Rc;
use std::sync::Arc;

/// What the filter driver needs from a dynamics model
pub trait StateTransitionModel {
    /// State dimension n
    fn state_dimension(&self) -> usize;
    /// Propagate `state` forward by `dt`.
    fn transition(&self, state: &DVector<f64>, dt: f64) -> Result<DVector<f64>>;
    /// Process-noise covariance estimate (n×n) at `state`.
    fn transition_noise(&self, state: &DVector<f64>) -> Result<DMatrix<f64>>;
}

impl<M: StateTransitionModel + ?Sized> StateTransitionModel for &M {
    fn state_dimension(&self) -> usize {
        (**self).state_dimension()
    }
    fn transition(&self, state: &DVector<f64>, dt: f64) -> Result<DVector<f64>> {
        (**self).transition(state, dt)
    }
    fn transition_noise(&self, state: &DVector<f64>) -> Result<DMatrix<f64>> {
        (**self).transition_noise(state)
    }
}
impl<M: StateTransitionModel + ?Sized> StateTransitionModel for Rc<M> {
    fn state_dimension(&self) -> usize {
        (**self).state_dimension()
    }
    fn transition(&self, state: &DVector<f64>, dt: f64) -> Result<DVector<f64>> {
        (**self).transition(state, dt)
    }
    fn transition_noise(&self, state: &DVector<f64>) -> Result<DMatrix<f64>> {
        (**self).transition_noise(state)
    }
}
impl<M: StateTransitionModel + ?Sized> StateTransitionModel for Arc<M> {
    fn state_dimension(&self) -> usize {
        (**self).state_dimension()
    }
    fn transition(&self, state: &DVector<f64>, dt: f64) -> Result<DVector<f64>> {
        (**self).transition(state, dt)
    }
    fn transition_noise(&self, state: &DVector<f64>) -> Result<DMatrix<f64>> {
        (**self).transition_noise(state)
    }
}

/// Reshape a backend mean into a length-n row, transposing single-column output.
pub fn derivative_row(mean: &DMatrix<f64>, n: usize) -> Result<RowDVector<f64>> {
    match mean.shape() {
        (1, cols) if cols == n => Ok(mean.row(0).into_owned()),
        (rows, 1) if rows == n => Ok(mean.column(0).transpose()),
        (rows, cols) => Err(FilterError::shape("backend mean derivative", n, rows * cols)),
    }
}

/// Expand a backend covariance into an n×n matrix.
pub fn covariance_matrix(covariance: PredictiveCovariance, n: usize) -> Result<DMatrix<f64>> {
    match covariance {
        PredictiveCovariance::Full(m) if m.shape() == (n, n) => Ok(m),
        PredictiveCovariance::Full(m) => {
            Err(FilterError::shape("backend covariance", n, m.nrows().max(m.ncols())))
        }
        PredictiveCovariance::Diagonal(v) if v.len() == n => Ok(DMatrix::from_diagonal(&v)),
        PredictiveCovariance::Diagonal(v) => {
            Err(FilterError::shape("backend variance", n, v.len()))
        }
    }
}

/// Gaussian-process state space model: backend + normalization
#[derive(Clone, Debug)]
pub struct GpStateSpaceModel<B: RegressionBackend> {
    dimension: usize,
    backend: B,
    state_normalizer: Normalizer,
    derivative_normalizer: Normalizer,
    training: TrainingSet,
}
impl<B: RegressionBackend> GpStateSpaceModel<B> {
    /// Fit normalization parameters from `training` and take ownership of an unfitted backend.
    ///
    /// The normalization parameters are computed here, once, and never change afterwards.
    ///
    /// # Errors
    /// * `ShapeMismatch` if the backend dimension differs from the training dimension.
    pub fn new(training: TrainingSet, backend: B, normalization: NormalizationKind) -> Result<Self> {
        let dimension = training.dimension();
        if backend.dimension() != dimension {
            return Err(FilterError::shape(
                "backend dimension",
                dimension,
                backend.dimension(),
            ));
        }
        let state_normalizer = Normalizer::fit(normalization, training.states())?;
        let derivative_normalizer = Normalizer::fit(normalization, training.derivatives())?;
        let training = TrainingSet::new(
            derivative_normalizer.forward_rows(training.derivatives())?,
            state_normalizer.forward_rows(training.states())?,
        )?;
        Ok(GpStateSpaceModel {
            dimension,
            backend,
            state_normalizer,
            derivative_normalizer,
            training,
        })
    }
    /// Fit the backend on the normalized training data.
    pub fn optimize(&mut self, options: &FitOptions) -> Result<FitReport> {
        let report = self.backend.fit(&self.training, options)?;
        debug!(
            "Fitted {}-dimensional backend on {} samples, loss {:.4}",
            self.dimension,
            self.training.samples(),
            report.final_loss
        );
        Ok(report)
    }
    pub fn backend(&self) -> &B {
        &self.backend
    }
    pub fn state_normalizer(&self) -> &Normalizer {
        &self.state_normalizer
    }
    pub fn derivative_normalizer(&self) -> &Normalizer {
        &self.derivative_normalizer
    }
    /// Training data in normalized coordinates, as handed to the backend
    pub fn normalized_training(&self) -> &TrainingSet {
        &self.training
    }
    /// Learned derivative at `state`, in raw units, as a length-n row.
    pub fn derivative(&self, state: &DVector<f64>) -> Result<RowDVector<f64>> {
        self.check_state(state)?;
        let query = self.state_normalizer.forward(state)?;
        let raw = self.backend.predict_mean(&query)?;
        let row = derivative_row(&raw, self.dimension)?;
        let derivative = self.derivative_normalizer.inverse(&row.transpose())?;
        Ok(derivative.transpose())
    }
    fn check_state(&self, state: &DVector<f64>) -> Result<()> {
        if state.len() != self.dimension {
            return Err(FilterError::shape("state", self.dimension, state.len()));
        }
        Ok(())
    }
}
impl<B: RegressionBackend> StateTransitionModel for GpStateSpaceModel<B> {
    fn state_dimension(&self) -> usize {
        self.dimension
    }
    fn transition(&self, state: &DVector<f64>, dt: f64) -> Result<DVector<f64>> {
        let derivative = self.derivative(state)?;
        Ok(state + derivative.transpose() * dt)
    }
    fn transition_noise(&self, state: &DVector<f64>) -> Result<DMatrix<f64>> {
        self.check_state(state)?;
        let query = self.state_normalizer.forward(state)?;
        let covariance = match self.backend.predict_covariance(&query)? {
            PredictiveCovariance::Diagonal(v) => {
                if v.len() != self.dimension {
                    return Err(FilterError::shape("backend variance", self.dimension, v.len()));
                }
                PredictiveCovariance::Diagonal(self.derivative_normalizer.inverse_variance(&v)?)
            }
            PredictiveCovariance::Full(m) => {
                if m.shape() != (self.dimension, self.dimension) {
                    return Err(FilterError::shape(
                        "backend covariance",
                        self.dimension,
                        m.nrows().max(m.ncols()),
                    ));
                }
                PredictiveCovariance::Full(self.derivative_normalizer.inverse_covariance(&m)?)
            }
        };
        covariance_matrix(covariance, self.dimension)
    }
}
