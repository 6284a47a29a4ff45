//! Paired state/derivative samples used to fit a regression backend.
//!
//! Both matrices hold one sample per row: `states` is D×n and `derivatives` is D×n, where row
//! `i` of `derivatives` is the observed rate of change of the system at row `i` of `states`.

use crate::error::{FilterError, Result};

use nalgebra::DMatrix;
use std::error::Error;
use std::path::Path;

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSet {
    derivatives: DMatrix<f64>,
    states: DMatrix<f64>,
}
impl TrainingSet {
    /// Pair derivative samples with the states they were observed at.
    ///
    /// # Errors
    /// * `InvalidTrainingData` if there are no samples or no dimensions.
    /// * `ShapeMismatch` if the two matrices disagree on sample count or dimension.
    pub fn new(derivatives: DMatrix<f64>, states: DMatrix<f64>) -> Result<Self> {
        if states.nrows() == 0 || states.ncols() == 0 {
            return Err(FilterError::InvalidTrainingData(format!(
                "training states are {}x{}",
                states.nrows(),
                states.ncols()
            )));
        }
        if derivatives.nrows() != states.nrows() {
            return Err(FilterError::shape(
                "training derivative samples",
                states.nrows(),
                derivatives.nrows(),
            ));
        }
        if derivatives.ncols() != states.ncols() {
            return Err(FilterError::shape(
                "training derivative dimension",
                states.ncols(),
                derivatives.ncols(),
            ));
        }
        Ok(TrainingSet {
            derivatives,
            states,
        })
    }
    /// Build a training set from a uniformly sampled trajectory (one state per row) using
    /// forward finite differences. The last state has no successor and is dropped.
    pub fn from_trajectory(trajectory: &DMatrix<f64>, dt: f64) -> Result<Self> {
        if trajectory.nrows() < 2 {
            return Err(FilterError::InvalidTrainingData(
                "a trajectory needs at least two samples".to_string(),
            ));
        }
        if dt <= 0.0 || !dt.is_finite() {
            return Err(FilterError::InvalidTrainingData(format!(
                "sample interval must be positive, got {dt}"
            )));
        }
        let d = trajectory.nrows() - 1;
        let states = trajectory.rows(0, d).into_owned();
        let derivatives = (trajectory.rows(1, d) - &states) / dt;
        TrainingSet::new(derivatives, states)
    }
    /// Reads a CSV file with a header row whose first `n` columns are the state and whose
    /// last `n` columns are the derivative at that state.
    ///
    /// # Returns
    /// * `Ok(TrainingSet)` if successful.
    /// * `Err` if the file cannot be read or parsed, or the column count is odd.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> std::result::Result<Self, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut values = Vec::new();
        let mut width = None;
        for result in rdr.deserialize() {
            let row: Vec<f64> = result?;
            match width {
                None => width = Some(row.len()),
                Some(w) if w != row.len() => {
                    return Err(format!("ragged CSV row: expected {w} columns, got {}", row.len()).into());
                }
                Some(_) => {}
            }
            values.extend(row);
        }
        let width = width.ok_or("CSV file holds no samples")?;
        if width == 0 || width % 2 != 0 {
            return Err(format!("expected 2n columns (state, derivative), got {width}").into());
        }
        let n = width / 2;
        let table = DMatrix::from_row_slice(values.len() / width, width, &values);
        let states = table.columns(0, n).into_owned();
        let derivatives = table.columns(n, n).into_owned();
        Ok(TrainingSet::new(derivatives, states)?)
    }
    /// Writes the set in the layout read by [Self::from_csv].
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), Box<dyn Error>> {
        let mut wtr = csv::Writer::from_path(path)?;
        let n = self.dimension();
        let header: Vec<String> = (0..n)
            .map(|j| format!("x{j}"))
            .chain((0..n).map(|j| format!("dx{j}")))
            .collect();
        wtr.write_record(&header)?;
        for i in 0..self.samples() {
            let record: Vec<String> = self
                .states
                .row(i)
                .iter()
                .chain(self.derivatives.row(i).iter())
                .map(|v| v.to_string())
                .collect();
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
    pub fn states(&self) -> &DMatrix<f64> {
        &self.states
    }
    pub fn derivatives(&self) -> &DMatrix<f64> {
        &self.derivatives
    }
    /// Number of samples D
    pub fn samples(&self) -> usize {
        self.states.nrows()
    }
    /// State dimension n
    pub fn dimension(&self) -> usize {
        self.states.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn rejects_mismatched_shapes() {
        let states = DMatrix::<f64>::zeros(5, 2);
        let err = TrainingSet::new(DMatrix::zeros(4, 2), states.clone()).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { expected: 5, got: 4, .. }));
        let err = TrainingSet::new(DMatrix::zeros(5, 3), states).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { expected: 2, got: 3, .. }));
    }

    #[test]
    fn rejects_empty() {
        let err = TrainingSet::new(DMatrix::zeros(0, 2), DMatrix::zeros(0, 2)).unwrap_err();
        assert!(matches!(err, FilterError::InvalidTrainingData(_)));
    }

    #[test]
    fn finite_differences() {
        let trajectory = DMatrix::from_row_slice(3, 2, &[0.0, 1.0, 0.5, 1.0, 1.5, 0.0]);
        let set = TrainingSet::from_trajectory(&trajectory, 0.5).unwrap();
        assert_eq!(set.samples(), 2);
        assert_eq!(set.dimension(), 2);
        assert_approx_eq!(set.derivatives()[(0, 0)], 1.0, 1e-15);
        assert_approx_eq!(set.derivatives()[(1, 0)], 2.0, 1e-15);
        assert_approx_eq!(set.derivatives()[(1, 1)], -2.0, 1e-15);
    }

    #[test]
    fn csv_round_trip() {
        let states = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 2.0, 3.0]);
        let derivatives = DMatrix::from_row_slice(2, 2, &[-1.0, 0.5, 0.25, 4.0]);
        let set = TrainingSet::new(derivatives, states).unwrap();
        let file = NamedTempFile::new().unwrap();
        set.to_csv(file.path()).unwrap();
        let loaded = TrainingSet::from_csv(file.path()).unwrap();
        assert_eq!(loaded, set);
    }
}
