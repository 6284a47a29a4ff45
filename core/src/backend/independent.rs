//! Independent per-dimension Gaussian process regression.
//!
//! Each derivative component gets its own exact GP over the full state, with its own
//! squared-exponential hyperparameters. Components are uncorrelated, so the predictive
//! covariance is reported as a vector of variances and the mean is returned column-shaped
//! (n×1), one row per output surface.

use super::kernel::{self, KernelHyperparameters, squared_distances};
use super::optimizer::Adam;
use super::{
    FitOptions, FitReport, PredictiveCovariance, Prediction, RegressionBackend, check_query,
    check_training,
};
use crate::error::{FilterError, Result};
use crate::training::TrainingSet;

use log::info;
use nalgebra::{DMatrix, DVector};

/// A single conditioned GP surface
#[derive(Clone, Debug)]
pub(crate) struct GpSurface {
    hyperparameters: KernelHyperparameters,
    lower: DMatrix<f64>,
    alpha: DVector<f64>,
}
impl GpSurface {
    pub(crate) fn condition(
        r2: &DMatrix<f64>,
        targets: &DVector<f64>,
        hyperparameters: KernelHyperparameters,
    ) -> Result<Self> {
        let mut k = hyperparameters.kernel().gram(r2);
        for i in 0..k.nrows() {
            k[(i, i)] += hyperparameters.noise_variance();
        }
        let chol = kernel::factor(k)?;
        let alpha = chol.solve(targets);
        Ok(GpSurface {
            hyperparameters,
            lower: chol.l(),
            alpha,
        })
    }
    pub(crate) fn mean(&self, cross: &DVector<f64>) -> f64 {
        cross.dot(&self.alpha)
    }
    /// Noise-free predictive variance, floored at zero
    pub(crate) fn variance(&self, cross: &DVector<f64>) -> Result<f64> {
        let v = self.lower.solve_lower_triangular(cross).ok_or_else(|| {
            FilterError::NonPositiveSemiDefinite("singular GP Cholesky factor".to_string())
        })?;
        Ok((self.hyperparameters.signal_variance() - v.norm_squared()).max(0.0))
    }
}

#[derive(Clone, Debug)]
pub struct IndependentGp {
    dimension: usize,
    initial: KernelHyperparameters,
    inputs: Option<DMatrix<f64>>,
    surfaces: Vec<GpSurface>,
}
impl IndependentGp {
    pub fn new(dimension: usize) -> Self {
        IndependentGp {
            dimension,
            initial: KernelHyperparameters::default(),
            inputs: None,
            surfaces: Vec::new(),
        }
    }
    /// Starting point for every surface's hyperparameter search
    pub fn with_initial_hyperparameters(mut self, initial: KernelHyperparameters) -> Self {
        self.initial = initial;
        self
    }
    /// Fitted hyperparameters, one entry per output dimension
    pub fn hyperparameters(&self) -> Vec<KernelHyperparameters> {
        self.surfaces.iter().map(|s| s.hyperparameters).collect()
    }
    fn fitted_inputs(&self) -> Result<&DMatrix<f64>> {
        match &self.inputs {
            Some(x) if self.surfaces.len() == self.dimension => Ok(x),
            _ => Err(FilterError::ModelNotFitted),
        }
    }
}
impl RegressionBackend for IndependentGp {
    fn dimension(&self) -> usize {
        self.dimension
    }
    fn is_fitted(&self) -> bool {
        self.fitted_inputs().is_ok()
    }
    fn fit(&mut self, data: &TrainingSet, options: &FitOptions) -> Result<FitReport> {
        check_training(self.dimension, data)?;
        let samples = data.samples() as f64;
        let r2 = squared_distances(data.states());
        let mut surfaces = Vec::with_capacity(self.dimension);
        let mut final_loss = 0.0;
        for t in 0..self.dimension {
            let targets = data.derivatives().column(t).into_owned();
            let mut params = self.initial.to_array();
            let mut adam = Adam::new(options.learning_rate, params.len());
            let mut loss = f64::NAN;
            for i in 0..=options.iterations {
                let hp = KernelHyperparameters::from_array(params);
                let eval = kernel::log_marginal_likelihood(&r2, &targets, &hp)?;
                loss = -eval.log_likelihood / samples;
                if i == options.iterations {
                    break;
                }
                if options.verbose {
                    info!(
                        "Dimension {}: Iter {}/{} - Loss: {:.3}",
                        t,
                        i + 1,
                        options.iterations,
                        loss
                    );
                }
                let gradient = eval.gradient.map(|g| -g / samples);
                adam.step(&mut params, &gradient);
                params = KernelHyperparameters::from_array(params).to_array();
            }
            let hp = KernelHyperparameters::from_array(params);
            final_loss += loss;
            surfaces.push(GpSurface::condition(&r2, &targets, hp)?);
        }
        self.inputs = Some(data.states().clone());
        self.surfaces = surfaces;
        Ok(FitReport {
            iterations: options.iterations,
            final_loss,
        })
    }
    fn predict(&self, query: &DVector<f64>) -> Result<Prediction> {
        let inputs = self.fitted_inputs()?;
        check_query(self.dimension, query)?;
        let mut mean = DMatrix::zeros(self.dimension, 1);
        let mut variance = DVector::zeros(self.dimension);
        for (t, surface) in self.surfaces.iter().enumerate() {
            let cross = surface.hyperparameters.kernel().cross(inputs, query);
            mean[(t, 0)] = surface.mean(&cross);
            variance[t] = surface.variance(&cross)?;
        }
        Ok(Prediction {
            mean,
            covariance: PredictiveCovariance::Diagonal(variance),
        })
    }
    fn predict_mean(&self, query: &DVector<f64>) -> Result<DMatrix<f64>> {
        let inputs = self.fitted_inputs()?;
        check_query(self.dimension, query)?;
        Ok(DMatrix::from_fn(self.dimension, 1, |t, _| {
            let surface = &self.surfaces[t];
            surface.mean(&surface.hyperparameters.kernel().cross(inputs, query))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn linear_field() -> TrainingSet {
        // dx0 = x1, dx1 = -x0 on a small grid
        let mut states = Vec::new();
        let mut derivatives = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                let x0 = -1.0 + 0.4 * i as f64;
                let x1 = -1.0 + 0.4 * j as f64;
                states.extend([x0, x1]);
                derivatives.extend([x1, -x0]);
            }
        }
        TrainingSet::new(
            DMatrix::from_row_slice(36, 2, &derivatives),
            DMatrix::from_row_slice(36, 2, &states),
        )
        .unwrap()
    }

    #[test]
    fn predict_before_fit_fails() {
        let gp = IndependentGp::new(2);
        assert!(!gp.is_fitted());
        let err = gp.predict(&DVector::zeros(2)).unwrap_err();
        assert_eq!(err, FilterError::ModelNotFitted);
    }

    #[test]
    fn fit_recovers_linear_field() {
        let mut gp = IndependentGp::new(2);
        let options = FitOptions {
            iterations: 60,
            ..FitOptions::default()
        };
        let report = gp.fit(&linear_field(), &options).unwrap();
        assert!(report.final_loss.is_finite());
        assert!(gp.is_fitted());

        let prediction = gp.predict(&DVector::from_vec(vec![0.2, -0.6])).unwrap();
        assert_eq!(prediction.mean.shape(), (2, 1));
        assert_approx_eq!(prediction.mean[(0, 0)], -0.6, 0.1);
        assert_approx_eq!(prediction.mean[(1, 0)], -0.2, 0.1);
        let PredictiveCovariance::Diagonal(var) = prediction.covariance else {
            panic!("independent surfaces report per-dimension variances");
        };
        assert_eq!(var.len(), 2);
        assert!(var.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn final_loss_describes_fitted_hyperparameters() {
        let data = linear_field();
        let mut gp = IndependentGp::new(2);
        let report = gp
            .fit(&data, &FitOptions { iterations: 8, ..FitOptions::default() })
            .unwrap();
        let r2 = squared_distances(data.states());
        let samples = data.samples() as f64;
        let mut expected = 0.0;
        for (t, hp) in gp.hyperparameters().iter().enumerate() {
            let targets = data.derivatives().column(t).into_owned();
            expected -= kernel::log_marginal_likelihood(&r2, &targets, hp)
                .unwrap()
                .log_likelihood
                / samples;
        }
        assert_approx_eq!(report.final_loss, expected, 1e-12);
    }

    #[test]
    fn variance_grows_away_from_data() {
        let mut gp = IndependentGp::new(2);
        gp.fit(&linear_field(), &FitOptions::default()).unwrap();
        let near = gp.predict_covariance(&DVector::from_vec(vec![0.2, 0.2])).unwrap();
        let far = gp.predict_covariance(&DVector::from_vec(vec![8.0, -8.0])).unwrap();
        match (near, far) {
            (PredictiveCovariance::Diagonal(near), PredictiveCovariance::Diagonal(far)) => {
                assert!(far[0] > near[0]);
                assert!(far[1] > near[1]);
            }
            _ => panic!("expected diagonal covariances"),
        }
    }

    #[test]
    fn predict_mean_matches_predict() {
        let mut gp = IndependentGp::new(2);
        gp.fit(&linear_field(), &FitOptions { iterations: 5, ..FitOptions::default() })
            .unwrap();
        let q = DVector::from_vec(vec![0.5, 0.1]);
        assert_eq!(gp.predict_mean(&q).unwrap(), gp.predict(&q).unwrap().mean);
    }

    #[test]
    fn wrong_query_dimension() {
        let mut gp = IndependentGp::new(2);
        gp.fit(&linear_field(), &FitOptions { iterations: 1, ..FitOptions::default() })
            .unwrap();
        let err = gp.predict(&DVector::zeros(3)).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { expected: 2, got: 3, .. }));
    }

    #[test]
    fn wrong_training_dimension() {
        let mut gp = IndependentGp::new(3);
        let err = gp.fit(&linear_field(), &FitOptions::default()).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { .. }));
    }
}
