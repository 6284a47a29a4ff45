//! Unscented Kalman filtering with learned dynamics and learned process noise
//!
//! This crate estimates the state of a dynamical system whose transition function is not known
//! analytically. A probabilistic regression model (a Gaussian process) is fitted to observed
//! `(state, derivative)` pairs; its predictive mean drives the state transition and its predictive
//! covariance supplies the process noise of an unscented Kalman filter. Rather than a fixed,
//! hand-tuned $Q$, the filter re-estimates $Q$ at every prediction from the model's own
//! uncertainty across the current sigma points, so it inflates in regions the training data did
//! not cover and shrinks where the model is confident.
//!
//! This crate is primarily built off of a few additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra for the filter
//!   and the Gaussian-process backends.
//! - [`serde`](https://crates.io/crates/serde): Serialization of configuration types.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   Random number generation for synthetic data and simulation.
//!
//! ## Crate overview
//!
//! - [backend]: Regression backends (independent and coregionalized Gaussian processes) behind the
//!   [backend::RegressionBackend] trait.
//! - [normalize]: Fitted forward/inverse transforms for states, derivatives, and covariances.
//! - [training]: Paired state/derivative training data.
//! - [transition]: The learned state transition model, [transition::GpStateSpaceModel].
//! - [noise]: The adaptive process-noise aggregator.
//! - [unscented]: The unscented Kalman filter provider.
//! - [driver]: The adaptive-noise filter cycle, [driver::GpUnscentedFilter].
//! - [measurements]: Measurement models for the update step.
//! - [linalg]: Stabilized matrix square root and SPD solves.
//! - [sim] and [config]: Closed-loop simulation against reference systems.
//!
//! ## Prediction with learned noise
//!
//! Given the current belief $(\mu, P)$ of an n-dimensional state, the unscented transform places
//! $K = 2n + 1$ sigma points $\chi_i$. For each of them the regression model returns the predictive
//! covariance of the state derivative, $\Sigma_{\dot{x}}(\chi_i)$, and the process noise for the step
//! is their plain average
//!
//! $$
//! Q = \frac{1}{K} \sum_{i=0}^{K-1} \Sigma_{\dot{x}}(\chi_i)
//! $$
//!
//! The sigma points are then propagated with an explicit Euler step along the learned vector field,
//!
//! $$
//! \chi_i^+ = \chi_i + \hat{\dot{x}}(\chi_i)\, \Delta t
//! $$
//!
//! and recombined with the usual unscented weights, adding $Q$ to the predicted covariance. If
//! the model fails at any sigma point, the prediction is abandoned and the belief is left exactly
//! as it was.
//!
//! ## Example
//!
//! ```no_run
//! use gpfilter::backend::{FitOptions, IndependentGp};
//! use gpfilter::driver::GpUnscentedFilter;
//! use gpfilter::measurements::StateMeasurement;
//! use gpfilter::normalize::NormalizationKind;
//! use gpfilter::training::TrainingSet;
//! use gpfilter::transition::GpStateSpaceModel;
//! use gpfilter::unscented::UnscentedParameters;
//! use nalgebra::{DMatrix, DVector};
//!
//! let training = TrainingSet::from_csv("training.csv").unwrap();
//! let n = training.dimension();
//! let mut model =
//!     GpStateSpaceModel::new(training, IndependentGp::new(n), NormalizationKind::ZScore).unwrap();
//! model.optimize(&FitOptions::default()).unwrap();
//!
//! let mut filter = GpUnscentedFilter::new(
//!     model,
//!     DVector::zeros(n),
//!     DMatrix::identity(n, n),
//!     UnscentedParameters::default(),
//! )
//! .unwrap();
//! let (mean, covariance) = filter.predict(0.1).unwrap();
//! let z = StateMeasurement::full(&DVector::from_element(n, 0.5), 0.1);
//! filter.update(&z).unwrap();
//! # let _ = (mean, covariance);
//! ```

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod linalg;
pub mod measurements;
pub mod noise;
pub mod normalize;
pub mod sim;
pub mod training;
pub mod transition;
pub mod unscented;

pub use driver::{CyclePhase, GpUnscentedFilter};
pub use error::{FilterError, Operation, Result};
pub use noise::{NoiseScaling, aggregate_process_noise};
pub use transition::{GpStateSpaceModel, StateTransitionModel};
pub use unscented::{UnscentedKalmanFilter, UnscentedParameters};
