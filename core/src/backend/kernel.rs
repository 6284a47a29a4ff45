//! Squared-exponential covariance function and the exact-GP marginal likelihood.
//!
//! $$
//! k(x, x') = \sigma_f^2 \exp\left(-\frac{\lVert x - x' \rVert^2}{2 \ell^2}\right)
//! $$
//!
//! Hyperparameters are stored as logarithms so the optimizer can move them freely while the
//! kernel stays positive.

use crate::error::{FilterError, Result};

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use std::f64::consts::PI;

/// Lower bound on the noise variance so the Gram matrix stays factorable
pub const MIN_LOG_NOISE_VARIANCE: f64 = -13.8; // ≈ ln(1e-6)

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelHyperparameters {
    pub log_lengthscale: f64,
    pub log_signal_variance: f64,
    pub log_noise_variance: f64,
}
impl Default for KernelHyperparameters {
    fn default() -> Self {
        KernelHyperparameters {
            log_lengthscale: 0.0,
            log_signal_variance: 0.0,
            log_noise_variance: (0.1f64).ln(),
        }
    }
}
impl KernelHyperparameters {
    pub fn lengthscale(&self) -> f64 {
        self.log_lengthscale.exp()
    }
    pub fn signal_variance(&self) -> f64 {
        self.log_signal_variance.exp()
    }
    pub fn noise_variance(&self) -> f64 {
        self.log_noise_variance.exp()
    }
    pub fn kernel(&self) -> SquaredExponential {
        SquaredExponential {
            lengthscale: self.lengthscale(),
            signal_variance: self.signal_variance(),
        }
    }
    pub(crate) fn to_array(self) -> [f64; 3] {
        [
            self.log_lengthscale,
            self.log_signal_variance,
            self.log_noise_variance,
        ]
    }
    pub(crate) fn from_array(p: [f64; 3]) -> Self {
        KernelHyperparameters {
            log_lengthscale: p[0],
            log_signal_variance: p[1],
            log_noise_variance: p[2].max(MIN_LOG_NOISE_VARIANCE),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SquaredExponential {
    pub lengthscale: f64,
    pub signal_variance: f64,
}
impl SquaredExponential {
    /// Kernel value for a squared distance
    #[inline]
    pub fn from_squared_distance(&self, r2: f64) -> f64 {
        self.signal_variance * (-0.5 * r2 / (self.lengthscale * self.lengthscale)).exp()
    }
    /// Noise-free Gram matrix from precomputed squared distances
    pub fn gram(&self, squared_distances: &DMatrix<f64>) -> DMatrix<f64> {
        squared_distances.map(|r2| self.from_squared_distance(r2))
    }
    /// Covariance between every training row and a query point
    pub fn cross(&self, inputs: &DMatrix<f64>, query: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            inputs.nrows(),
            inputs.row_iter().map(|row| {
                let r2: f64 = row.iter().zip(query.iter()).map(|(a, b)| (a - b).powi(2)).sum();
                self.from_squared_distance(r2)
            }),
        )
    }
}

/// Pairwise squared Euclidean distances between the rows of `inputs`
pub fn squared_distances(inputs: &DMatrix<f64>) -> DMatrix<f64> {
    let d = inputs.nrows();
    DMatrix::from_fn(d, d, |i, j| (inputs.row(i) - inputs.row(j)).norm_squared())
}

/// Cholesky factor of a kernel matrix, with a small jitter ramp for near-singular Gram matrices.
pub(crate) fn factor(k: DMatrix<f64>) -> Result<Cholesky<f64, Dyn>> {
    if let Some(ch) = Cholesky::new(k.clone()) {
        return Ok(ch);
    }
    let n = k.nrows();
    let mut jitter = 1e-10;
    while jitter <= 1e-4 {
        let mut kj = k.clone();
        for i in 0..n {
            kj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(kj) {
            return Ok(ch);
        }
        jitter *= 10.0;
    }
    Err(FilterError::NonPositiveSemiDefinite(format!(
        "{n}x{n} kernel matrix could not be factored"
    )))
}

/// Log marginal likelihood and its gradient with respect to the log hyperparameters
#[derive(Clone, Copy, Debug)]
pub struct LikelihoodEvaluation {
    pub log_likelihood: f64,
    /// d/d[log ℓ, log σf², log σn²]
    pub gradient: [f64; 3],
}

/// Exact GP log marginal likelihood of `targets` under a squared-exponential kernel.
///
/// $$
/// \log p(y) = -\tfrac12 y^T K^{-1} y - \tfrac12 \log|K| - \tfrac{D}{2}\log 2\pi
/// $$
///
/// with gradient $\tfrac12 \operatorname{tr}\left((\alpha\alpha^T - K^{-1}) \partial K\right)$.
pub fn log_marginal_likelihood(
    squared_distances: &DMatrix<f64>,
    targets: &DVector<f64>,
    hyperparameters: &KernelHyperparameters,
) -> Result<LikelihoodEvaluation> {
    let d = targets.len();
    if squared_distances.nrows() != d {
        return Err(FilterError::shape("kernel targets", squared_distances.nrows(), d));
    }
    let kernel = hyperparameters.kernel();
    let signal = kernel.gram(squared_distances);
    let noise_variance = hyperparameters.noise_variance();
    let mut k = signal.clone();
    for i in 0..d {
        k[(i, i)] += noise_variance;
    }
    let chol = factor(k)?;
    let alpha = chol.solve(targets);
    let log_det: f64 = chol.l_dirty().diagonal().iter().map(|l| l.ln()).sum::<f64>() * 2.0;
    let log_likelihood =
        -0.5 * targets.dot(&alpha) - 0.5 * log_det - 0.5 * d as f64 * (2.0 * PI).ln();

    let w = &alpha * alpha.transpose() - chol.inverse();
    let inv_l2 = 1.0 / (kernel.lengthscale * kernel.lengthscale);
    let mut gradient = [0.0; 3];
    for i in 0..d {
        for j in 0..d {
            gradient[0] += w[(i, j)] * signal[(i, j)] * squared_distances[(i, j)] * inv_l2;
            gradient[1] += w[(i, j)] * signal[(i, j)];
        }
        gradient[2] += w[(i, i)] * noise_variance;
    }
    for g in gradient.iter_mut() {
        *g *= 0.5;
    }
    Ok(LikelihoodEvaluation {
        log_likelihood,
        gradient,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn toy() -> (DMatrix<f64>, DVector<f64>) {
        let x = DMatrix::from_row_slice(5, 1, &[-1.0, -0.4, 0.1, 0.7, 1.3]);
        let y = DVector::from_vec(vec![0.3, -0.2, 0.5, 0.9, -0.1]);
        (x, y)
    }

    #[test]
    fn kernel_values() {
        let k = SquaredExponential {
            lengthscale: 2.0,
            signal_variance: 3.0,
        };
        assert_approx_eq!(k.from_squared_distance(0.0), 3.0, 1e-15);
        assert_approx_eq!(k.from_squared_distance(4.0), 3.0 * (-0.5f64).exp(), 1e-15);
    }

    #[test]
    fn single_point_likelihood() {
        // One sample: y ~ N(0, σf² + σn²)
        let r2 = DMatrix::zeros(1, 1);
        let y = DVector::from_vec(vec![0.7]);
        let hp = KernelHyperparameters::default();
        let total = hp.signal_variance() + hp.noise_variance();
        let expected = -0.5 * 0.49 / total - 0.5 * total.ln() - 0.5 * (2.0 * PI).ln();
        let eval = log_marginal_likelihood(&r2, &y, &hp).unwrap();
        assert_approx_eq!(eval.log_likelihood, expected, 1e-12);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (x, y) = toy();
        let r2 = squared_distances(&x);
        let hp = KernelHyperparameters {
            log_lengthscale: -0.3,
            log_signal_variance: 0.2,
            log_noise_variance: -2.0,
        };
        let eval = log_marginal_likelihood(&r2, &y, &hp).unwrap();
        let h = 1e-6;
        for k in 0..3 {
            let mut plus = hp.to_array();
            let mut minus = hp.to_array();
            plus[k] += h;
            minus[k] -= h;
            let lp = log_marginal_likelihood(&r2, &y, &KernelHyperparameters::from_array(plus))
                .unwrap()
                .log_likelihood;
            let lm = log_marginal_likelihood(&r2, &y, &KernelHyperparameters::from_array(minus))
                .unwrap()
                .log_likelihood;
            assert_approx_eq!(eval.gradient[k], (lp - lm) / (2.0 * h), 1e-5);
        }
    }

    #[test]
    fn distances_are_symmetric() {
        let x = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 3.0, 4.0, 1.0, 1.0]);
        let r2 = squared_distances(&x);
        assert_approx_eq!(r2[(0, 1)], 25.0, 1e-15);
        assert_eq!(r2, r2.transpose());
    }
}
