//! Coregionalized multi-output Gaussian process.
//!
//! All derivative components share one unit-variance squared-exponential input kernel and are
//! coupled through a task covariance $B$ (intrinsic coregionalization model):
//!
//! $$
//! \operatorname{cov}(f_t(x), f_s(x')) = B_{ts}\, k(x, x')
//! $$
//!
//! $B$ is estimated from the second moment of the training derivatives; the shared lengthscale
//! and noise variance are fitted by maximizing the summed per-task marginal likelihoods. Queries
//! return a row-shaped (1×n) mean and a full n×n predictive covariance.

use super::kernel::{self, KernelHyperparameters, squared_distances};
use super::optimizer::Adam;
use super::{
    FitOptions, FitReport, PredictiveCovariance, Prediction, RegressionBackend, check_query,
    check_training,
};
use crate::error::{FilterError, Result};
use crate::linalg::symmetrize;
use crate::training::TrainingSet;

use log::info;
use nalgebra::{DMatrix, DVector};

const TASK_JITTER: f64 = 1e-8;

#[derive(Clone, Debug)]
struct JointPosterior {
    inputs: DMatrix<f64>,
    lower: DMatrix<f64>,
    alpha: DVector<f64>,
}

#[derive(Clone, Debug)]
pub struct MultitaskGp {
    dimension: usize,
    log_lengthscale: f64,
    log_noise_variance: f64,
    task_covariance: DMatrix<f64>,
    posterior: Option<JointPosterior>,
}
impl MultitaskGp {
    pub fn new(dimension: usize) -> Self {
        let initial = KernelHyperparameters::default();
        MultitaskGp {
            dimension,
            log_lengthscale: initial.log_lengthscale,
            log_noise_variance: initial.log_noise_variance,
            task_covariance: DMatrix::identity(dimension, dimension),
            posterior: None,
        }
    }
    /// Estimated coupling between derivative components
    pub fn task_covariance(&self) -> &DMatrix<f64> {
        &self.task_covariance
    }
    pub fn lengthscale(&self) -> f64 {
        self.log_lengthscale.exp()
    }
    pub fn noise_variance(&self) -> f64 {
        self.log_noise_variance.exp()
    }
    fn unit_kernel(&self) -> kernel::SquaredExponential {
        kernel::SquaredExponential {
            lengthscale: self.lengthscale(),
            signal_variance: 1.0,
        }
    }
    fn task_hyperparameters(&self, t: usize) -> KernelHyperparameters {
        KernelHyperparameters::from_array([
            self.log_lengthscale,
            self.task_covariance[(t, t)].ln(),
            self.log_noise_variance,
        ])
    }
    fn condition(&self, data: &TrainingSet, r2: &DMatrix<f64>) -> Result<JointPosterior> {
        let n = self.dimension;
        let d = data.samples();
        let kx = self.unit_kernel().gram(r2);
        let noise = self.noise_variance();
        // Task-major ordering: row t*d + i is task t at sample i
        let joint = DMatrix::from_fn(n * d, n * d, |r, c| {
            let value = self.task_covariance[(r / d, c / d)] * kx[(r % d, c % d)];
            if r == c { value + noise } else { value }
        });
        let y = data.derivatives();
        let stacked =
            DVector::from_iterator(n * d, (0..n).flat_map(|t| (0..d).map(move |i| y[(i, t)])));
        let chol = kernel::factor(joint)?;
        let alpha = chol.solve(&stacked);
        Ok(JointPosterior {
            inputs: data.states().clone(),
            lower: chol.l(),
            alpha,
        })
    }
}
impl RegressionBackend for MultitaskGp {
    fn dimension(&self) -> usize {
        self.dimension
    }
    fn is_fitted(&self) -> bool {
        self.posterior.is_some()
    }
    fn fit(&mut self, data: &TrainingSet, options: &FitOptions) -> Result<FitReport> {
        check_training(self.dimension, data)?;
        let samples = data.samples() as f64;
        let y = data.derivatives();
        let mut b = symmetrize(&((y.transpose() * y) / samples));
        for t in 0..self.dimension {
            b[(t, t)] += TASK_JITTER;
        }
        // Nothing reaches `self` until the posterior has been conditioned
        let mut candidate = MultitaskGp {
            dimension: self.dimension,
            log_lengthscale: self.log_lengthscale,
            log_noise_variance: self.log_noise_variance,
            task_covariance: b,
            posterior: None,
        };

        let r2 = squared_distances(data.states());
        let targets: Vec<DVector<f64>> =
            (0..self.dimension).map(|t| y.column(t).into_owned()).collect();
        let mut params = [candidate.log_lengthscale, candidate.log_noise_variance];
        let mut adam = Adam::new(options.learning_rate, params.len());
        let mut loss = f64::NAN;
        for i in 0..=options.iterations {
            candidate.log_lengthscale = params[0];
            candidate.log_noise_variance = params[1].max(kernel::MIN_LOG_NOISE_VARIANCE);
            let mut total = 0.0;
            let mut gradient = [0.0; 2];
            for (t, target) in targets.iter().enumerate() {
                let eval = kernel::log_marginal_likelihood(
                    &r2,
                    target,
                    &candidate.task_hyperparameters(t),
                )?;
                total += eval.log_likelihood;
                gradient[0] -= eval.gradient[0] / samples;
                gradient[1] -= eval.gradient[2] / samples;
            }
            loss = -total / samples;
            if i == options.iterations {
                break;
            }
            if options.verbose {
                info!("Iter {}/{} - Loss: {:.3}", i + 1, options.iterations, loss);
            }
            adam.step(&mut params, &gradient);
        }
        candidate.posterior = Some(candidate.condition(data, &r2)?);
        *self = candidate;
        Ok(FitReport {
            iterations: options.iterations,
            final_loss: loss,
        })
    }
    fn predict(&self, query: &DVector<f64>) -> Result<Prediction> {
        let posterior = self.posterior.as_ref().ok_or(FilterError::ModelNotFitted)?;
        check_query(self.dimension, query)?;
        let n = self.dimension;
        let d = posterior.inputs.nrows();
        let kx = self.unit_kernel().cross(&posterior.inputs, query);
        let cross = DMatrix::from_fn(n * d, n, |r, s| self.task_covariance[(r / d, s)] * kx[r % d]);
        let mean = cross.transpose() * &posterior.alpha;
        let v = posterior
            .lower
            .solve_lower_triangular(&cross)
            .ok_or_else(|| {
                FilterError::NonPositiveSemiDefinite("singular joint Cholesky factor".to_string())
            })?;
        let covariance = symmetrize(&(&self.task_covariance - v.transpose() * v));
        Ok(Prediction {
            mean: DMatrix::from_row_slice(1, n, mean.as_slice()),
            covariance: PredictiveCovariance::Full(covariance),
        })
    }
}
