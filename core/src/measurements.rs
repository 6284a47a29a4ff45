//! Measurement models for the update step.
//!
//! Measurement models are supplied by the caller; they are not learned. Two general purpose
//! models are provided: direct observation of a subset of the state, and an arbitrary linear
//! observation `z = H x`.

use crate::error::{FilterError, Result};

use std::any::Any;
use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};

/// Generic measurement model trait for all types of measurements
pub trait MeasurementModel: Any {
    /// Downcast helper method to allow for type-safe downcasting
    fn as_any(&self) -> &dyn Any;
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the measurement noise characteristics in a matrix format
    fn get_noise(&self) -> DMatrix<f64>;
    /// Get the expected measurements from the state. Measurement model function
    /// that maps the state values to measurement space. Fails with
    /// [FilterError::ShapeMismatch] when the model does not fit the state.
    fn get_expected_measurement(&self, state: &DVector<f64>) -> Result<DVector<f64>>;
}

/// Direct, independent observation of selected state components
#[derive(Clone, Debug, Default)]
pub struct StateMeasurement {
    /// State index observed by each measurement component
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
    /// One standard deviation per component
    pub noise_std: Vec<f64>,
}
impl StateMeasurement {
    pub fn new(indices: Vec<usize>, values: Vec<f64>, noise_std: Vec<f64>) -> Result<Self> {
        if values.len() != indices.len() {
            return Err(FilterError::shape("measurement values", indices.len(), values.len()));
        }
        if noise_std.len() != indices.len() {
            return Err(FilterError::shape("measurement noise", indices.len(), noise_std.len()));
        }
        Ok(StateMeasurement {
            indices,
            values,
            noise_std,
        })
    }
    /// Observe every component of an n-dimensional state with the same noise
    pub fn full(values: &DVector<f64>, noise_std: f64) -> Self {
        StateMeasurement {
            indices: (0..values.len()).collect(),
            values: values.iter().copied().collect(),
            noise_std: vec![noise_std; values.len()],
        }
    }
}
impl Display for StateMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateMeasurement(indices: {:?}, values: {:?}, noise_std: {:?})",
            self.indices, self.values, self.noise_std
        )
    }
}
impl MeasurementModel for StateMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        self.indices.len()
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(self.values.clone())
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_iterator(
            self.noise_std.len(),
            self.noise_std.iter().map(|s| s.powi(2)),
        ))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> Result<DVector<f64>> {
        let mut expected = DVector::<f64>::zeros(self.indices.len());
        for (k, &i) in self.indices.iter().enumerate() {
            expected[k] = *state
                .get(i)
                .ok_or_else(|| FilterError::shape("observed state index", state.len(), i))?;
        }
        Ok(expected)
    }
}

/// Linear measurement `z = H x + v`, `v ~ N(0, R)`
#[derive(Clone, Debug)]
pub struct LinearMeasurement {
    pub observation: DMatrix<f64>,
    pub value: DVector<f64>,
    pub noise: DMatrix<f64>,
}
impl LinearMeasurement {
    pub fn new(observation: DMatrix<f64>, value: DVector<f64>, noise: DMatrix<f64>) -> Result<Self> {
        let m = observation.nrows();
        if value.len() != m {
            return Err(FilterError::shape("measurement value", m, value.len()));
        }
        if noise.shape() != (m, m) {
            return Err(FilterError::shape("measurement noise", m, noise.nrows()));
        }
        Ok(LinearMeasurement {
            observation,
            value,
            noise,
        })
    }
}
impl Display for LinearMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LinearMeasurement(dim: {}, value: {:?})",
            self.value.len(),
            self.value.as_slice()
        )
    }
}
impl MeasurementModel for LinearMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        self.value.len()
    }
    fn get_vector(&self) -> DVector<f64> {
        self.value.clone()
    }
    fn get_noise(&self) -> DMatrix<f64> {
        self.noise.clone()
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> Result<DVector<f64>> {
        if self.observation.ncols() != state.len() {
            return Err(FilterError::shape(
                "observation matrix columns",
                state.len(),
                self.observation.ncols(),
            ));
        }
        Ok(&self.observation * state)
    }
}
