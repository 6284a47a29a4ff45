//! Optional per-column normalization of states and derivatives.
//!
//! A [Normalizer] is either the identity or an affine map fitted once from a data matrix
//! (one sample per row):
//!
//! $$
//! x' = (x - o) \oslash s \qquad x = x' \odot s + o
//! $$
//!
//! Means and covariances do not transform alike. A covariance expressed in normalized units
//! maps back through the scale only, entry by entry:
//!
//! $$
//! \Sigma_{ij} = \Sigma'_{ij} \, s_i \, s_j
//! $$
//!
//! so variances pick up the squared scale and the offset plays no part.

use crate::error::{FilterError, Result};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Which normalization to fit from training data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationKind {
    /// Leave values untouched
    #[default]
    None,
    /// Map each column onto [0, 1] using its minimum and range
    MinMax,
    /// Center each column on its mean and divide by its standard deviation
    ZScore,
}

/// Per-column offset and scale of a fitted affine normalization
#[derive(Clone, Debug, PartialEq)]
pub struct AffineParameters {
    offset: DVector<f64>,
    scale: DVector<f64>,
}
impl AffineParameters {
    /// Build parameters directly. Zero or non-finite scales are replaced by 1.
    pub fn new(offset: DVector<f64>, scale: DVector<f64>) -> Result<Self> {
        if offset.len() != scale.len() {
            return Err(FilterError::NormalizationParameter {
                expected: offset.len(),
                got: scale.len(),
            });
        }
        let scale = scale.map(|s| if s.abs() > f64::EPSILON && s.is_finite() { s } else { 1.0 });
        Ok(AffineParameters { offset, scale })
    }
    pub fn offset(&self) -> &DVector<f64> {
        &self.offset
    }
    pub fn scale(&self) -> &DVector<f64> {
        &self.scale
    }
    pub fn dimension(&self) -> usize {
        self.offset.len()
    }
}

/// Deterministic forward/inverse transform pair
#[derive(Clone, Debug, PartialEq)]
pub enum Normalizer {
    Identity,
    Affine(AffineParameters),
}
impl Normalizer {
    /// Fit a normalizer of the given kind from `data` (rows are samples, columns dimensions).
    pub fn fit(kind: NormalizationKind, data: &DMatrix<f64>) -> Result<Self> {
        if data.nrows() == 0 {
            return Err(FilterError::InvalidTrainingData(
                "cannot fit normalization on an empty matrix".to_string(),
            ));
        }
        let n = data.ncols();
        let params = match kind {
            NormalizationKind::None => return Ok(Normalizer::Identity),
            NormalizationKind::MinMax => {
                let mut offset = DVector::zeros(n);
                let mut scale = DVector::zeros(n);
                for (j, column) in data.column_iter().enumerate() {
                    offset[j] = column.min();
                    scale[j] = column.max() - column.min();
                }
                AffineParameters::new(offset, scale)?
            }
            NormalizationKind::ZScore => {
                let samples = data.nrows() as f64;
                let mut offset = DVector::zeros(n);
                let mut scale = DVector::zeros(n);
                for (j, column) in data.column_iter().enumerate() {
                    let mean = column.sum() / samples;
                    let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples;
                    offset[j] = mean;
                    scale[j] = variance.sqrt();
                }
                AffineParameters::new(offset, scale)?
            }
        };
        Ok(Normalizer::Affine(params))
    }
    fn check(&self, len: usize) -> Result<Option<&AffineParameters>> {
        match self {
            Normalizer::Identity => Ok(None),
            Normalizer::Affine(p) if p.dimension() == len => Ok(Some(p)),
            Normalizer::Affine(p) => Err(FilterError::NormalizationParameter {
                expected: p.dimension(),
                got: len,
            }),
        }
    }
    /// Raw values to normalized values
    pub fn forward(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(match self.check(x.len())? {
            None => x.clone(),
            Some(p) => (x - &p.offset).component_div(&p.scale),
        })
    }
    /// Normalized values back to raw values
    pub fn inverse(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(match self.check(x.len())? {
            None => x.clone(),
            Some(p) => x.component_mul(&p.scale) + &p.offset,
        })
    }
    /// Apply [Self::forward] to every row of a sample matrix.
    pub fn forward_rows(&self, data: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let Some(p) = self.check(data.ncols())? else {
            return Ok(data.clone());
        };
        let mut out = data.clone();
        for mut row in out.row_iter_mut() {
            for j in 0..p.dimension() {
                row[j] = (row[j] - p.offset[j]) / p.scale[j];
            }
        }
        Ok(out)
    }
    /// Normalized covariance back to raw units: Σᵢⱼ = Σ'ᵢⱼ sᵢ sⱼ
    pub fn inverse_covariance(&self, cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if !cov.is_square() {
            return Err(FilterError::shape("covariance (columns)", cov.nrows(), cov.ncols()));
        }
        Ok(match self.check(cov.nrows())? {
            None => cov.clone(),
            Some(p) => DMatrix::from_fn(cov.nrows(), cov.ncols(), |i, j| {
                cov[(i, j)] * p.scale[i] * p.scale[j]
            }),
        })
    }
    /// Raw covariance to normalized units: Σ'ᵢⱼ = Σᵢⱼ / (sᵢ sⱼ)
    pub fn forward_covariance(&self, cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if !cov.is_square() {
            return Err(FilterError::shape("covariance (columns)", cov.nrows(), cov.ncols()));
        }
        Ok(match self.check(cov.nrows())? {
            None => cov.clone(),
            Some(p) => DMatrix::from_fn(cov.nrows(), cov.ncols(), |i, j| {
                cov[(i, j)] / (p.scale[i] * p.scale[j])
            }),
        })
    }
    /// Normalized per-dimension variances back to raw units: σᵢ² = σ'ᵢ² sᵢ²
    pub fn inverse_variance(&self, var: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(match self.check(var.len())? {
            None => var.clone(),
            Some(p) => var.component_mul(&p.scale.component_mul(&p.scale)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn data() -> DMatrix<f64> {
        DMatrix::from_row_slice(4, 2, &[1.0, -10.0, 3.0, 0.0, 2.0, 10.0, 5.0, 20.0])
    }

    #[test]
    fn min_max_parameters() {
        let norm = Normalizer::fit(NormalizationKind::MinMax, &data()).unwrap();
        let Normalizer::Affine(p) = &norm else {
            panic!("expected fitted parameters");
        };
        assert_eq!(p.offset().as_slice(), &[1.0, -10.0]);
        assert_eq!(p.scale().as_slice(), &[4.0, 30.0]);
        let rows = norm.forward_rows(&data()).unwrap();
        assert_approx_eq!(rows.column(0).min(), 0.0, 1e-15);
        assert_approx_eq!(rows.column(1).max(), 1.0, 1e-15);
    }

    #[test]
    fn z_score_parameters() {
        let norm = Normalizer::fit(NormalizationKind::ZScore, &data()).unwrap();
        let rows = norm.forward_rows(&data()).unwrap();
        for column in rows.column_iter() {
            let mean = column.sum() / 4.0;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
            assert_approx_eq!(mean, 0.0, 1e-12);
            assert_approx_eq!(var, 1.0, 1e-12);
        }
    }

    #[test]
    fn round_trip() {
        for kind in [NormalizationKind::None, NormalizationKind::MinMax, NormalizationKind::ZScore] {
            let norm = Normalizer::fit(kind, &data()).unwrap();
            let x = DVector::from_vec(vec![-7.25, 123.5]);
            let back = norm.inverse(&norm.forward(&x).unwrap()).unwrap();
            assert_approx_eq!(back[0], x[0], 1e-12);
            assert_approx_eq!(back[1], x[1], 1e-12);
        }
    }

    #[test]
    fn covariance_uses_squared_scale() {
        let norm = Normalizer::fit(NormalizationKind::MinMax, &data()).unwrap();
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]);
        let raw = norm.inverse_covariance(&cov).unwrap();
        // scales are 4 and 30; offsets must not leak in
        assert_approx_eq!(raw[(0, 0)], 16.0, 1e-12);
        assert_approx_eq!(raw[(0, 1)], 0.5 * 4.0 * 30.0, 1e-12);
        assert_approx_eq!(raw[(1, 1)], 2.0 * 900.0, 1e-9);
        let back = norm.forward_covariance(&raw).unwrap();
        assert!((back - &cov).abs().max() < 1e-12);

        let var = norm.inverse_variance(&DVector::from_vec(vec![1.0, 2.0])).unwrap();
        assert_approx_eq!(var[0], raw[(0, 0)], 1e-12);
        assert_approx_eq!(var[1], raw[(1, 1)], 1e-9);
    }

    #[test]
    fn covariance_is_not_the_mean_transform() {
        let norm = Normalizer::fit(NormalizationKind::MinMax, &data()).unwrap();
        let var = DVector::from_vec(vec![1.0, 1.0]);
        let as_mean = norm.inverse(&var).unwrap();
        let as_variance = norm.inverse_variance(&var).unwrap();
        assert!((as_mean[0] - as_variance[0]).abs() > 1.0);
    }

    #[test]
    fn constant_column_uses_unit_scale() {
        let flat = DMatrix::from_row_slice(3, 1, &[2.0, 2.0, 2.0]);
        let norm = Normalizer::fit(NormalizationKind::MinMax, &flat).unwrap();
        let x = norm.forward(&DVector::from_vec(vec![3.0])).unwrap();
        assert_approx_eq!(x[0], 1.0, 1e-15);
    }

    #[test]
    fn mismatched_dimension_is_error() {
        let norm = Normalizer::fit(NormalizationKind::ZScore, &data()).unwrap();
        let err = norm.inverse(&DVector::from_vec(vec![1.0, 2.0, 3.0])).unwrap_err();
        assert_eq!(err, FilterError::NormalizationParameter { expected: 2, got: 3 });
    }

    #[test]
    fn identity_passes_through() {
        let norm = Normalizer::Identity;
        let cov = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 1.0, 3.0]);
        assert_eq!(norm.inverse_covariance(&cov).unwrap(), cov);
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(norm.forward(&x).unwrap(), x);
    }
}
