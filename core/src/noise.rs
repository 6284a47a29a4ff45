//! Adaptive process noise from the learned covariance at every sigma point.
//!
//! Rather than a fixed user-supplied $Q$, the predict step uses the unweighted average of the
//! learned derivative covariance over the current sigma-point ensemble:
//!
//! $$
//! Q = \frac{1}{K} \sum_{i=0}^{K-1} \Sigma_{\dot{x}}(\chi_i)
//! $$
//!
//! The unscented weights are deliberately not used here: every sigma point is treated as an
//! equally plausible state, so $Q$ follows the spread of the belief and not only its mean.

use crate::error::{FilterError, Operation, Result};
use crate::linalg::symmetrize;
use crate::transition::StateTransitionModel;

use log::trace;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// How the aggregated covariance relates to the prediction interval `dt`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseScaling {
    /// The learned covariance is the noise added per predict step, whatever `dt` is
    #[default]
    PerStep,
    /// The learned covariance is a rate; the injected noise is `Q * dt`
    PerUnitTime,
}
impl NoiseScaling {
    /// Noise to inject for a step of length `dt`
    pub fn apply(&self, q: DMatrix<f64>, dt: f64) -> DMatrix<f64> {
        match self {
            NoiseScaling::PerStep => q,
            NoiseScaling::PerUnitTime => q * dt,
        }
    }
}

/// Average the learned process-noise covariance over a sigma-point set.
///
/// # Arguments
/// * `model` - the learned transition model queried at every point
/// * `sigma_points` - n×K matrix with one sigma point per column
///
/// # Errors
/// Any model error is returned wrapped in [FilterError::SigmaPoint] with the failing column
/// index; the wrapped error itself is unchanged.
pub fn aggregate_process_noise<M: StateTransitionModel + ?Sized>(
    model: &M,
    sigma_points: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    let n = model.state_dimension();
    if sigma_points.nrows() != n {
        return Err(FilterError::shape("sigma point dimension", n, sigma_points.nrows()));
    }
    if sigma_points.ncols() == 0 {
        return Err(FilterError::shape("sigma point count", 1, 0));
    }
    // Running mean: a constant covariance comes back bit-for-bit
    let mut mean = DMatrix::<f64>::zeros(n, n);
    for (i, point) in sigma_points.column_iter().enumerate() {
        let q = model
            .transition_noise(&point.clone_owned())
            .map_err(|e| e.at_sigma_point(i, Operation::TransitionNoise))?;
        if q.shape() != (n, n) {
            return Err(FilterError::shape("transition noise", n, q.nrows().max(q.ncols()))
                .at_sigma_point(i, Operation::TransitionNoise));
        }
        trace!("sigma point {i}: noise diagonal {:?}", q.diagonal().as_slice());
        mean += (q - &mean) / (i + 1) as f64;
    }
    Ok(symmetrize(&mean))
}
