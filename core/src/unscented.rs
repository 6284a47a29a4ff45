//! Unscented Kalman filter provider.
//!
//! A plain additive-noise UKF over an n-dimensional state using Merwe scaled sigma points
//! (2n+1 points, parameters α, β, κ). The dynamics are supplied per call to
//! [UnscentedKalmanFilter::predict_with] and the process-noise covariance lives in a public slot,
//! so a driver can overwrite it before every prediction. The matrix square root used to spread
//! the sigma points is pluggable and defaults to [matrix_square_root].
//!
//! Both `predict_with` and `update` compute the new mean and covariance in full before storing
//! them: when either returns an error the filter state is exactly what it was before the call.

use crate::error::{FilterError, Operation, Result};
use crate::linalg::{matrix_square_root, robust_spd_solve, symmetrize};
use crate::measurements::MeasurementModel;

use std::fmt::{self, Debug, Display};

use log::trace;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Square-root routine used for sigma-point generation: returns `L` with `L * L^T ≈ M`.
pub type SquareRootFn = fn(&DMatrix<f64>) -> Result<DMatrix<f64>>;

/// Diagonal loading applied after each measurement update
const UPDATE_REGULARIZATION: f64 = 1e-9;

/// Merwe scaled sigma-point parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnscentedParameters {
    /// Spread of the sigma points around the mean
    pub alpha: f64,
    /// Prior knowledge of the distribution; 2 is optimal for Gaussians
    pub beta: f64,
    /// Secondary scaling
    pub kappa: f64,
}
impl Default for UnscentedParameters {
    fn default() -> Self {
        UnscentedParameters {
            alpha: 1e-3,
            beta: 2.0,
            kappa: 0.0,
        }
    }
}

/// Unscented Kalman Filter implementation
#[derive(Clone)]
pub struct UnscentedKalmanFilter {
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    lambda: f64,
    state_size: usize,
    weights_mean: DVector<f64>,
    weights_cov: DVector<f64>,
    square_root: SquareRootFn,
}
impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("lambda", &self.lambda)
            .field("state_size", &self.state_size)
            .finish()
    }
}
impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnscentedKalmanFilter(n: {}, mean: {:?}, variance: {:?})",
            self.state_size,
            self.mean_state.as_slice(),
            self.covariance.diagonal().as_slice()
        )
    }
}
impl UnscentedKalmanFilter {
    /// Create a filter seeded with a mean and covariance.
    ///
    /// The process-noise slot starts at zero; callers are expected to set it before predicting.
    ///
    /// # Errors
    /// * `ShapeMismatch` if `covariance` is not n×n for the n of `mean`, or `mean` is empty.
    pub fn new(
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        parameters: UnscentedParameters,
    ) -> Result<UnscentedKalmanFilter> {
        let state_size = mean.len();
        if state_size == 0 {
            return Err(FilterError::shape("state dimension", 1, 0));
        }
        if covariance.shape() != (state_size, state_size) {
            return Err(FilterError::shape(
                "initial covariance",
                state_size,
                covariance.nrows().max(covariance.ncols()),
            ));
        }
        let UnscentedParameters { alpha, beta, kappa } = parameters;
        let n = state_size as f64;
        let lambda = alpha * alpha * (n + kappa) - n;
        let mut weights_mean = DVector::zeros(2 * state_size + 1);
        let mut weights_cov = DVector::zeros(2 * state_size + 1);
        weights_mean[0] = lambda / (n + lambda);
        weights_cov[0] = lambda / (n + lambda) + (1.0 - alpha * alpha + beta);
        for i in 1..(2 * state_size + 1) {
            let w = 1.0 / (2.0 * (n + lambda));
            weights_mean[i] = w;
            weights_cov[i] = w;
        }
        Ok(UnscentedKalmanFilter {
            mean_state: mean,
            covariance,
            process_noise: DMatrix::zeros(state_size, state_size),
            lambda,
            state_size,
            weights_mean,
            weights_cov,
            square_root: matrix_square_root,
        })
    }
    /// Replace the square-root routine used for sigma-point generation
    pub fn with_square_root(mut self, square_root: SquareRootFn) -> Self {
        self.square_root = square_root;
        self
    }
    pub fn state_dimension(&self) -> usize {
        self.state_size
    }
    pub fn lambda(&self) -> f64 {
        self.lambda
    }
    pub fn weights_mean(&self) -> &DVector<f64> {
        &self.weights_mean
    }
    pub fn weights_cov(&self) -> &DVector<f64> {
        &self.weights_cov
    }
    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.process_noise
    }
    /// Overwrite the process-noise covariance used by the next prediction.
    pub fn set_process_noise(&mut self, process_noise: DMatrix<f64>) -> Result<()> {
        if process_noise.shape() != (self.state_size, self.state_size) {
            return Err(FilterError::shape(
                "process noise",
                self.state_size,
                process_noise.nrows().max(process_noise.ncols()),
            ));
        }
        self.process_noise = process_noise;
        Ok(())
    }
    pub fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }
    pub fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
    /// Sigma points of the current belief, one per column (n × 2n+1).
    pub fn sigma_points(&self) -> Result<DMatrix<f64>> {
        let p = (self.state_size as f64 + self.lambda) * &self.covariance;
        let sqrt_p = (self.square_root)(&p)?;
        if sqrt_p.shape() != (self.state_size, self.state_size) {
            return Err(FilterError::shape(
                "covariance square root",
                self.state_size,
                sqrt_p.nrows().max(sqrt_p.ncols()),
            ));
        }
        let mu = &self.mean_state;
        let mut pts = DMatrix::<f64>::zeros(self.state_size, 2 * self.state_size + 1);
        pts.column_mut(0).copy_from(mu);
        for i in 0..sqrt_p.ncols() {
            pts.column_mut(i + 1).copy_from(&(mu + sqrt_p.column(i)));
            pts.column_mut(i + 1 + self.state_size)
                .copy_from(&(mu - sqrt_p.column(i)));
        }
        Ok(pts)
    }
    /// Propagate every sigma point through `dynamics` and recombine, adding the process noise.
    ///
    /// A failing sigma point is reported as [FilterError::SigmaPoint] with
    /// [Operation::Transition]; nothing is stored in that case.
    pub fn predict_with<F>(&mut self, dt: f64, mut dynamics: F) -> Result<()>
    where
        F: FnMut(&DVector<f64>, f64) -> Result<DVector<f64>>,
    {
        let sigma_points = self.sigma_points()?;
        let mut propagated = DMatrix::<f64>::zeros(self.state_size, sigma_points.ncols());
        for (i, sigma_point) in sigma_points.column_iter().enumerate() {
            let next = dynamics(&sigma_point.clone_owned(), dt)
                .map_err(|e| e.at_sigma_point(i, Operation::Transition))?;
            if next.len() != self.state_size {
                return Err(FilterError::shape("propagated state", self.state_size, next.len())
                    .at_sigma_point(i, Operation::Transition));
            }
            propagated.set_column(i, &next);
        }
        let mut mu_bar = DVector::<f64>::zeros(self.state_size);
        for (i, sigma_point) in propagated.column_iter().enumerate() {
            mu_bar += self.weights_mean[i] * sigma_point;
        }
        let mut p_bar = DMatrix::<f64>::zeros(self.state_size, self.state_size);
        for (i, sigma_point) in propagated.column_iter().enumerate() {
            let diff = sigma_point - &mu_bar;
            p_bar += self.weights_cov[i] * &diff * &diff.transpose();
        }
        p_bar += &self.process_noise;
        trace!("predicted mean {:?}", mu_bar.as_slice());
        self.mean_state = mu_bar;
        self.covariance = symmetrize(&p_bar);
        Ok(())
    }
    /// Standard unscented measurement update.
    pub fn update<M: MeasurementModel + ?Sized>(&mut self, measurement: &M) -> Result<()> {
        let m = measurement.get_dimension();
        let z = measurement.get_vector();
        if z.len() != m {
            return Err(FilterError::shape("measurement vector", m, z.len()));
        }
        let r = measurement.get_noise();
        if r.shape() != (m, m) {
            return Err(FilterError::shape("measurement noise", m, r.nrows().max(r.ncols())));
        }
        let sigma_points = self.sigma_points()?;
        let mut measurement_sigma_points = DMatrix::<f64>::zeros(m, sigma_points.ncols());
        let mut z_hat = DVector::<f64>::zeros(m);
        for (i, sigma_point) in sigma_points.column_iter().enumerate() {
            let expected = measurement.get_expected_measurement(&sigma_point.clone_owned())?;
            if expected.len() != m {
                return Err(FilterError::shape("expected measurement", m, expected.len()));
            }
            z_hat += self.weights_mean[i] * &expected;
            measurement_sigma_points.set_column(i, &expected);
        }
        let mut s = DMatrix::<f64>::zeros(m, m);
        for (i, sigma_point) in measurement_sigma_points.column_iter().enumerate() {
            let diff = sigma_point - &z_hat;
            s += self.weights_cov[i] * &diff * &diff.transpose();
        }
        s += r;
        let mut cross_covariance = DMatrix::<f64>::zeros(self.state_size, m);
        for (i, measurement_sigma_point) in measurement_sigma_points.column_iter().enumerate() {
            let measurement_diff = measurement_sigma_point - &z_hat;
            let state_diff = sigma_points.column(i) - &self.mean_state;
            cross_covariance += self.weights_cov[i] * state_diff * measurement_diff.transpose();
        }
        let k = robust_kalman_gain(&cross_covariance, &s)?;
        let mean = &self.mean_state + &k * (z - &z_hat);
        let mut covariance = symmetrize(&(&self.covariance - &k * &s * &k.transpose()));
        for i in 0..self.state_size {
            covariance[(i, i)] += UPDATE_REGULARIZATION;
        }
        self.mean_state = mean;
        self.covariance = covariance;
        Ok(())
    }
}

/// K = C S^-1, computed as the solution of S K^T = C^T
fn robust_kalman_gain(cross_covariance: &DMatrix<f64>, s: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let kt = robust_spd_solve(&symmetrize(s), &cross_covariance.transpose())?;
    Ok(kt.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{LinearMeasurement, StateMeasurement};
    use assert_approx_eq::assert_approx_eq;

    const PARAMS: UnscentedParameters = UnscentedParameters {
        alpha: 1e-3,
        beta: 2.0,
        kappa: 0.0,
    };

    fn ukf(mean: &[f64], variance: f64) -> UnscentedKalmanFilter {
        let n = mean.len();
        UnscentedKalmanFilter::new(
            DVector::from_column_slice(mean),
            DMatrix::identity(n, n) * variance,
            PARAMS,
        )
        .unwrap()
    }

    #[test]
    fn ukf_construction() {
        let ukf = ukf(&[0.0; 4], 1.0);
        let wms = ukf.weights_mean();
        let wcs = ukf.weights_cov();
        assert_eq!(wms.len(), 9);
        assert_eq!(wcs.len(), 9);
        let lambda = PARAMS.alpha.powi(2) * (4.0 + PARAMS.kappa) - 4.0;
        assert_eq!(lambda, ukf.lambda());
        let wm_0 = lambda / (4.0 + lambda);
        let wc_0 = wm_0 + (1.0 - PARAMS.alpha.powi(2)) + PARAMS.beta;
        let w_i = 1.0 / (2.0 * (4.0 + lambda));
        assert_approx_eq!(wms[0], wm_0, 1e-6);
        assert_approx_eq!(wcs[0], wc_0, 1e-6);
        for i in 1..wms.len() {
            assert_approx_eq!(wms[i], w_i, 1e-6);
            assert_approx_eq!(wcs[i], w_i, 1e-6);
        }
        assert_approx_eq!(wms.sum(), 1.0, 1e-9);
    }

    #[test]
    fn construction_rejects_bad_covariance() {
        let err = UnscentedKalmanFilter::new(DVector::zeros(2), DMatrix::identity(3, 3), PARAMS)
            .unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { expected: 2, got: 3, .. }));
    }

    #[test]
    fn ukf_get_sigma_points() {
        let ukf = ukf(&[1.0, -2.0, 0.5], 0.2);
        let sigma_points = ukf.sigma_points().unwrap();
        assert_eq!(sigma_points.shape(), (3, 7));
        let mu = &sigma_points * ukf.weights_mean();
        assert_approx_eq!(mu[0], 1.0, 1e-6);
        assert_approx_eq!(mu[1], -2.0, 1e-6);
        assert_approx_eq!(mu[2], 0.5, 1e-6);
        // Symmetric pairs around the mean
        for i in 1..4 {
            let plus = sigma_points.column(i) - ukf.get_estimate();
            let minus = sigma_points.column(i + 3) - ukf.get_estimate();
            assert_approx_eq!((plus + minus).norm(), 0.0, 1e-12);
        }
    }

    #[test]
    fn identity_dynamics_adds_process_noise() {
        let mut ukf = ukf(&[0.0], 1.0);
        ukf.set_process_noise(DMatrix::from_element(1, 1, 1.0)).unwrap();
        ukf.predict_with(1.0, |x, _| Ok(x.clone())).unwrap();
        assert_approx_eq!(ukf.get_estimate()[0], 0.0, 1e-12);
        assert_approx_eq!(ukf.get_certainty()[(0, 0)], 2.0, 1e-6);
    }

    #[test]
    fn linear_dynamics_matches_kalman_prediction() {
        // x' = A x with A = [[1, dt], [0, 1]] so P' = A P A^T + Q
        let mut ukf = ukf(&[1.0, 2.0], 0.5);
        let q = DMatrix::identity(2, 2) * 0.01;
        ukf.set_process_noise(q.clone()).unwrap();
        let dt = 0.1;
        ukf.predict_with(dt, |x, dt| Ok(DVector::from_vec(vec![x[0] + dt * x[1], x[1]])))
            .unwrap();
        let a = DMatrix::from_row_slice(2, 2, &[1.0, dt, 0.0, 1.0]);
        let expected = &a * DMatrix::identity(2, 2) * 0.5 * a.transpose() + q;
        let p = ukf.get_certainty();
        for i in 0..2 {
            for j in 0..2 {
                assert_approx_eq!(p[(i, j)], expected[(i, j)], 1e-6);
            }
        }
        assert_approx_eq!(ukf.get_estimate()[0], 1.2, 1e-6);
    }

    #[test]
    fn failing_dynamics_leaves_state_untouched() {
        let mut ukf = ukf(&[0.0, 0.0], 1.0);
        let before = (ukf.get_estimate(), ukf.get_certainty());
        let mut calls = 0;
        let err = ukf
            .predict_with(1.0, |x, _| {
                calls += 1;
                if calls == 4 {
                    Err(FilterError::ModelNotFitted)
                } else {
                    Ok(x.clone())
                }
            })
            .unwrap_err();
        match err {
            FilterError::SigmaPoint { index, operation, .. } => {
                assert_eq!(index, 3);
                assert_eq!(operation, Operation::Transition);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(ukf.get_estimate(), before.0);
        assert_eq!(ukf.get_certainty(), before.1);
    }

    #[test]
    fn process_noise_shape_is_checked() {
        let mut ukf = ukf(&[0.0, 0.0], 1.0);
        assert!(ukf.set_process_noise(DMatrix::identity(3, 3)).is_err());
        assert_eq!(ukf.process_noise(), &DMatrix::zeros(2, 2));
    }

    #[test]
    fn update_pulls_toward_measurement() {
        let mut ukf = ukf(&[0.0, 0.0], 1.0);
        let measurement = StateMeasurement::new(vec![0], vec![1.0], vec![1.0]).unwrap();
        ukf.update(&measurement).unwrap();
        // Equal prior and measurement variance: halfway, variance halved
        assert_approx_eq!(ukf.get_estimate()[0], 0.5, 1e-6);
        assert_approx_eq!(ukf.get_certainty()[(0, 0)], 0.5, 1e-6);
        assert_approx_eq!(ukf.get_estimate()[1], 0.0, 1e-9);
        assert_approx_eq!(ukf.get_certainty()[(1, 1)], 1.0, 1e-6);
    }

    #[test]
    fn update_with_linear_measurement() {
        let mut ukf = ukf(&[0.0, 0.0], 1.0);
        let h = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let m = LinearMeasurement::new(h, DVector::from_vec(vec![3.0]), DMatrix::identity(1, 1))
            .unwrap();
        ukf.update(&m).unwrap();
        // S = 3, K = [1/3, 1/3]
        assert_approx_eq!(ukf.get_estimate()[0], 1.0, 1e-6);
        assert_approx_eq!(ukf.get_estimate()[1], 1.0, 1e-6);
        assert_approx_eq!(ukf.get_certainty()[(0, 1)], -1.0 / 3.0, 1e-6);
    }

    #[test]
    fn update_rejects_index_outside_state() {
        let mut ukf = ukf(&[0.5, -0.5], 1.0);
        let before = (ukf.get_estimate(), ukf.get_certainty());
        let measurement = StateMeasurement::new(vec![5], vec![1.0], vec![1.0]).unwrap();
        let err = ukf.update(&measurement).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { .. }));
        assert_eq!(ukf.get_estimate(), before.0);
        assert_eq!(ukf.get_certainty(), before.1);
    }

    #[test]
    fn update_rejects_observation_of_wrong_width() {
        let mut ukf = ukf(&[0.5, -0.5], 1.0);
        let before = (ukf.get_estimate(), ukf.get_certainty());
        let m = LinearMeasurement::new(
            DMatrix::identity(1, 3),
            DVector::from_vec(vec![1.0]),
            DMatrix::identity(1, 1),
        )
        .unwrap();
        let err = ukf.update(&m).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { expected: 2, got: 3, .. }));
        assert_eq!(ukf.get_estimate(), before.0);
        assert_eq!(ukf.get_certainty(), before.1);
    }

    #[test]
    fn pluggable_square_root_errors_propagate() {
        fn broken(_: &DMatrix<f64>) -> Result<DMatrix<f64>> {
            Err(FilterError::NonPositiveSemiDefinite("broken".to_string()))
        }
        let mut ukf = ukf(&[0.0], 1.0).with_square_root(broken);
        assert!(ukf.sigma_points().is_err());
        assert!(ukf.predict_with(1.0, |x, _| Ok(x.clone())).is_err());
        assert_eq!(ukf.get_certainty()[(0, 0)], 1.0);
    }
}
