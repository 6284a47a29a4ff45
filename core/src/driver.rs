//! Adaptive-noise unscented filter driver.
//!
//! [GpUnscentedFilter] runs one predict/update cycle around an [UnscentedKalmanFilter]:
//!
//! 1. generate sigma points from the current belief,
//! 2. average the learned process-noise covariance over them ([aggregate_process_noise]),
//! 3. write the result into the provider's process-noise slot,
//! 4. run the standard unscented prediction with the learned transition as dynamics,
//! 5. optionally fuse a measurement.
//!
//! A failure in any of steps 1-4 aborts the cycle. The persisted mean and covariance are left
//! as they were, the previous process noise is restored, and the driver goes back to
//! [CyclePhase::Idle].

use crate::error::{FilterError, Result};
use crate::measurements::MeasurementModel;
use crate::noise::{NoiseScaling, aggregate_process_noise};
use crate::transition::StateTransitionModel;
use crate::unscented::{UnscentedKalmanFilter, UnscentedParameters};

use std::fmt::{self, Display};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

/// Where the driver is within a predict/update cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CyclePhase {
    #[default]
    Idle,
    SigmaGenerated,
    NoiseComputed,
    Predicted,
    Updated,
}
impl Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::SigmaGenerated => "sigma-generated",
            CyclePhase::NoiseComputed => "noise-computed",
            CyclePhase::Predicted => "predicted",
            CyclePhase::Updated => "updated",
        };
        write!(f, "{name}")
    }
}

/// Unscented filter whose process noise is learned alongside its dynamics
#[derive(Debug)]
pub struct GpUnscentedFilter<M: StateTransitionModel> {
    ukf: UnscentedKalmanFilter,
    model: M,
    scaling: NoiseScaling,
    phase: CyclePhase,
}
impl<M: StateTransitionModel> GpUnscentedFilter<M> {
    /// Seed the filter with an initial belief.
    ///
    /// # Errors
    /// * `ShapeMismatch` if the mean, covariance, and model dimensions disagree.
    pub fn new(
        model: M,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        parameters: UnscentedParameters,
    ) -> Result<Self> {
        let n = model.state_dimension();
        if mean.len() != n {
            return Err(FilterError::shape("initial mean", n, mean.len()));
        }
        let ukf = UnscentedKalmanFilter::new(mean, covariance, parameters)?;
        Ok(GpUnscentedFilter {
            ukf,
            model,
            scaling: NoiseScaling::default(),
            phase: CyclePhase::Idle,
        })
    }
    /// Wrap an already configured provider, e.g. one with a custom square root
    pub fn from_provider(model: M, ukf: UnscentedKalmanFilter) -> Result<Self> {
        let n = model.state_dimension();
        if ukf.state_dimension() != n {
            return Err(FilterError::shape(
                "provider dimension",
                n,
                ukf.state_dimension(),
            ));
        }
        Ok(GpUnscentedFilter {
            ukf,
            model,
            scaling: NoiseScaling::default(),
            phase: CyclePhase::Idle,
        })
    }
    pub fn with_noise_scaling(mut self, scaling: NoiseScaling) -> Self {
        self.scaling = scaling;
        self
    }
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }
    pub fn model(&self) -> &M {
        &self.model
    }
    pub fn provider(&self) -> &UnscentedKalmanFilter {
        &self.ukf
    }
    pub fn get_estimate(&self) -> DVector<f64> {
        self.ukf.get_estimate()
    }
    pub fn get_certainty(&self) -> DMatrix<f64> {
        self.ukf.get_certainty()
    }
    /// Process noise injected by the most recent successful prediction
    pub fn last_process_noise(&self) -> &DMatrix<f64> {
        self.ukf.process_noise()
    }
    /// Run one prediction of length `dt` and return the new mean and covariance.
    pub fn predict(&mut self, dt: f64) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let previous_noise = self.ukf.process_noise().clone();
        match self.try_predict(dt) {
            Ok(()) => {
                self.phase = CyclePhase::Predicted;
                Ok((self.ukf.get_estimate(), self.ukf.get_certainty()))
            }
            Err(e) => {
                warn!("Predict cycle aborted in phase {}: {}", self.phase, e);
                // Only the noise slot can have changed at this point
                self.ukf.set_process_noise(previous_noise)?;
                self.phase = CyclePhase::Idle;
                Err(e)
            }
        }
    }
    fn try_predict(&mut self, dt: f64) -> Result<()> {
        self.phase = CyclePhase::Idle;
        let sigma_points = self.ukf.sigma_points()?;
        self.phase = CyclePhase::SigmaGenerated;

        let q = aggregate_process_noise(&self.model, &sigma_points)?;
        let q = self.scaling.apply(q, dt);
        debug!("Process noise diagonal: {:?}", q.diagonal().as_slice());
        self.phase = CyclePhase::NoiseComputed;

        self.ukf.set_process_noise(q)?;
        let model = &self.model;
        self.ukf.predict_with(dt, |x, dt| model.transition(x, dt))
    }
    /// Fuse a measurement into the predicted belief and return the new mean and covariance.
    ///
    /// Only valid right after a successful [GpUnscentedFilter::predict]; any other phase fails
    /// with [FilterError::OutOfPhase]. On error the belief is unchanged and the phase is left
    /// where it was.
    pub fn update<Z: MeasurementModel + ?Sized>(
        &mut self,
        measurement: &Z,
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        if self.phase != CyclePhase::Predicted {
            return Err(FilterError::OutOfPhase(self.phase));
        }
        self.ukf.update(measurement)?;
        debug!("Updated after phase {}", self.phase);
        self.phase = CyclePhase::Updated;
        Ok((self.ukf.get_estimate(), self.ukf.get_certainty()))
    }
    /// Close the cycle
    pub fn reset_phase(&mut self) {
        self.phase = CyclePhase::Idle;
    }
}
