//! Closed-loop simulation of learned-dynamics filtering.
//!
//! This module provides:
//! - Reference dynamical systems ([VanDerPol], [ThreeTank]) behind the [DynamicalSystem] trait
//! - RK4 integration for ground truth
//! - Synthetic training data generation around a reference trajectory
//! - [run_closed_loop], which fits a backend, runs the adaptive-noise filter against noisy
//!   full-state measurements, and reports per-step results plus an RMSE summary
//! - CSV export of the per-step results

use crate::backend::{FitReport, build_backend};
use crate::config::SimulationConfig;
use crate::driver::GpUnscentedFilter;
use crate::error::{FilterError, Result};
use crate::measurements::StateMeasurement;
use crate::training::TrainingSet;
use crate::transition::GpStateSpaceModel;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Number of RK4 sub-steps per filter step when integrating the truth
pub const RK4_SUBSTEPS: usize = 10;
/// Spread of training states around the reference trajectory
const TRAINING_STATE_SPREAD: f64 = 0.1;

/// A continuous-time system `dx/dt = f(x)` with a known vector field
pub trait DynamicalSystem {
    fn dimension(&self) -> usize;
    /// The true vector field at `state`
    fn derivative(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Starting point used when the configuration does not name one
    fn default_initial_state(&self) -> DVector<f64>;
    fn name(&self) -> &'static str;
}

/// Van der Pol oscillator: $\ddot{x} - \mu (1 - x^2) \dot{x} + x = 0$
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VanDerPol {
    pub mu: f64,
}
impl DynamicalSystem for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }
    fn derivative(&self, state: &DVector<f64>) -> DVector<f64> {
        let (x, v) = (state[0], state[1]);
        DVector::from_vec(vec![v, self.mu * (1.0 - x * x) * v - x])
    }
    fn default_initial_state(&self) -> DVector<f64> {
        DVector::from_vec(vec![2.0, 0.0])
    }
    fn name(&self) -> &'static str {
        "van-der-pol"
    }
}

/// Three cascaded tanks draining under Torricelli's law.
///
/// Tank 1 is fed by a constant inflow; each tank drains into the next at a rate
/// `c_i * sqrt(h_i)`. Levels below zero are treated as empty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThreeTank {
    pub inflow: f64,
    pub outflow: [f64; 3],
}
impl Default for ThreeTank {
    fn default() -> Self {
        ThreeTank {
            inflow: 0.3,
            outflow: [0.4, 0.35, 0.3],
        }
    }
}
impl DynamicalSystem for ThreeTank {
    fn dimension(&self) -> usize {
        3
    }
    fn derivative(&self, state: &DVector<f64>) -> DVector<f64> {
        let q: Vec<f64> = (0..3)
            .map(|i| self.outflow[i] * state[i].max(0.0).sqrt())
            .collect();
        DVector::from_vec(vec![self.inflow - q[0], q[0] - q[1], q[1] - q[2]])
    }
    fn default_initial_state(&self) -> DVector<f64> {
        DVector::from_vec(vec![0.6, 0.4, 0.2])
    }
    fn name(&self) -> &'static str {
        "three-tank"
    }
}

/// Which reference system drives a simulation
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SystemKind {
    VanDerPol { mu: f64 },
    ThreeTank,
}
impl Default for SystemKind {
    fn default() -> Self {
        SystemKind::VanDerPol { mu: 1.0 }
    }
}
impl SystemKind {
    pub fn build(&self) -> Box<dyn DynamicalSystem> {
        match *self {
            SystemKind::VanDerPol { mu } => Box::new(VanDerPol { mu }),
            SystemKind::ThreeTank => Box::new(ThreeTank::default()),
        }
    }
}

/// Advance `state` by `dt` with `substeps` classical Runge-Kutta steps.
pub fn rk4<S: DynamicalSystem + ?Sized>(
    system: &S,
    state: &DVector<f64>,
    dt: f64,
    substeps: usize,
) -> DVector<f64> {
    let substeps = substeps.max(1);
    let h = dt / substeps as f64;
    let mut x = state.clone();
    for _ in 0..substeps {
        let k1 = system.derivative(&x);
        let k2 = system.derivative(&(&x + &k1 * (h / 2.0)));
        let k3 = system.derivative(&(&x + &k2 * (h / 2.0)));
        let k4 = system.derivative(&(&x + &k3 * h));
        x += (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
    }
    x
}

fn normal(std_dev: f64, what: &str) -> Result<Normal<f64>> {
    Normal::new(0.0, std_dev).map_err(|e| {
        FilterError::InvalidTrainingData(format!("invalid {what} standard deviation {std_dev}: {e}"))
    })
}

/// Sample a training set around the trajectory that starts at `initial`.
///
/// The reference trajectory is integrated over `horizon` seconds and visited at `samples`
/// evenly spaced times. At each visit a state is drawn around the trajectory and the true
/// derivative there, corrupted by zero-mean noise of standard deviation `noise_std`, is recorded.
pub fn generate_training_set<S, R>(
    system: &S,
    initial: &DVector<f64>,
    horizon: f64,
    samples: usize,
    noise_std: f64,
    rng: &mut R,
) -> Result<TrainingSet>
where
    S: DynamicalSystem + ?Sized,
    R: Rng + ?Sized,
{
    let n = system.dimension();
    if initial.len() != n {
        return Err(FilterError::shape("initial state", n, initial.len()));
    }
    if samples == 0 {
        return Err(FilterError::InvalidTrainingData(
            "at least one training sample is required".to_string(),
        ));
    }
    let spread = normal(TRAINING_STATE_SPREAD, "state spread")?;
    let noise = normal(noise_std, "derivative noise")?;
    let h = horizon / samples as f64;
    let mut states = DMatrix::zeros(samples, n);
    let mut derivatives = DMatrix::zeros(samples, n);
    let mut x = initial.clone();
    for i in 0..samples {
        let sample = x.map(|v| v + spread.sample(rng));
        let derivative = system.derivative(&sample).map(|v| v + noise.sample(rng));
        states.set_row(i, &sample.transpose());
        derivatives.set_row(i, &derivative.transpose());
        x = rk4(system, &x, h, RK4_SUBSTEPS);
    }
    debug!(
        "Generated {} training samples for {} over {:.2} s",
        samples,
        system.name(),
        horizon
    );
    TrainingSet::new(derivatives, states)
}

/// One filter step of a closed-loop run
#[derive(Clone, Debug, PartialEq)]
pub struct FilterResult {
    pub step: usize,
    /// Elapsed time (s)
    pub time: f64,
    pub truth: Vec<f64>,
    pub estimate: Vec<f64>,
    /// Diagonal of the filter covariance
    pub variance: Vec<f64>,
    /// Diagonal of the process noise injected at this step
    pub process_noise: Vec<f64>,
    /// Whether a measurement was fused at this step
    pub updated: bool,
}

/// Summary statistics of a closed-loop run
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedLoopSummary {
    pub system: String,
    /// Root-mean-square estimation error per state dimension
    pub rmse: Vec<f64>,
    pub fit: FitReport,
}

#[derive(Clone, Debug)]
pub struct ClosedLoopRun {
    pub results: Vec<FilterResult>,
    pub summary: ClosedLoopSummary,
}

/// Fit a backend on synthetic data and filter the true system with it.
///
/// # Errors
/// Any fitting, shape, or filter error. A failed predict or update ends the run.
pub fn run_closed_loop(config: &SimulationConfig) -> Result<ClosedLoopRun> {
    let system = config.system.build();
    let n = system.dimension();
    let initial = if config.initial_state.is_empty() {
        system.default_initial_state()
    } else {
        DVector::from_vec(config.initial_state.clone())
    };
    if initial.len() != n {
        return Err(FilterError::shape("initial state", n, initial.len()));
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let horizon = config.steps as f64 * config.dt;
    let training = generate_training_set(
        system.as_ref(),
        &initial,
        horizon,
        config.training_samples,
        config.training_noise_std,
        &mut rng,
    )?;

    let backend = build_backend(config.backend, n);
    let mut model = GpStateSpaceModel::new(training, backend, config.normalization)?;
    let fit = model.optimize(&config.fit)?;
    info!(
        "Fitted {:?} backend for {}: final loss {:.4}",
        config.backend,
        system.name(),
        fit.final_loss
    );

    let covariance = DMatrix::identity(n, n) * config.initial_variance;
    let mut filter = GpUnscentedFilter::new(model, initial.clone(), covariance, config.unscented)?
        .with_noise_scaling(config.noise_scaling);
    let measurement_noise = normal(config.measurement_noise_std, "measurement noise")?;

    let mut truth = initial;
    let mut results = Vec::with_capacity(config.steps);
    let mut squared_error = DVector::<f64>::zeros(n);
    for step in 1..=config.steps {
        truth = rk4(system.as_ref(), &truth, config.dt, RK4_SUBSTEPS);
        filter.predict(config.dt)?;
        let process_noise = filter.last_process_noise().diagonal();
        let updated = config.measurement_interval > 0 && step % config.measurement_interval == 0;
        if updated {
            let z = truth.map(|v| v + measurement_noise.sample(&mut rng));
            let measurement = StateMeasurement::full(&z, config.measurement_noise_std);
            filter.update(&measurement)?;
        }
        filter.reset_phase();

        let estimate = filter.get_estimate();
        let error = &estimate - &truth;
        squared_error += error.component_mul(&error);
        results.push(FilterResult {
            step,
            time: step as f64 * config.dt,
            truth: truth.iter().copied().collect(),
            estimate: estimate.iter().copied().collect(),
            variance: filter.get_certainty().diagonal().iter().copied().collect(),
            process_noise: process_noise.iter().copied().collect(),
            updated,
        });
    }
    let steps = config.steps.max(1) as f64;
    let rmse = squared_error.map(|e| (e / steps).sqrt());
    info!("RMSE per state: {:?}", rmse.as_slice());
    Ok(ClosedLoopRun {
        results,
        summary: ClosedLoopSummary {
            system: system.name().to_string(),
            rmse: rmse.iter().copied().collect(),
            fit,
        },
    })
}

/// Writes per-step results to a CSV file.
///
/// Columns: `step, time, updated`, then `truth_i`, `estimate_i`, `variance_i`, and `q_i` for
/// every state dimension `i`.
pub fn write_results_csv<P: AsRef<Path>>(results: &[FilterResult], path: P) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let n = results.first().map_or(0, |r| r.truth.len());
    let mut header = vec!["step".to_string(), "time".to_string(), "updated".to_string()];
    for prefix in ["truth", "estimate", "variance", "q"] {
        header.extend((0..n).map(|i| format!("{prefix}_{i}")));
    }
    writer.write_record(&header)?;
    for r in results {
        let mut record = vec![r.step.to_string(), r.time.to_string(), r.updated.to_string()];
        for values in [&r.truth, &r.estimate, &r.variance, &r.process_noise] {
            record.extend(values.iter().map(|v| v.to_string()));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, FitOptions};
    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    /// dx/dt = -x
    struct Decay;
    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }
        fn derivative(&self, state: &DVector<f64>) -> DVector<f64> {
            -state
        }
        fn default_initial_state(&self) -> DVector<f64> {
            DVector::from_vec(vec![1.0])
        }
        fn name(&self) -> &'static str {
            "decay"
        }
    }

    fn quick_config() -> SimulationConfig {
        SimulationConfig {
            steps: 20,
            training_samples: 30,
            fit: FitOptions {
                iterations: 10,
                ..FitOptions::default()
            },
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn van_der_pol_vector_field() {
        let vdp = VanDerPol { mu: 2.0 };
        let d = vdp.derivative(&DVector::from_vec(vec![0.5, 1.0]));
        assert_eq!(d[0], 1.0);
        assert_approx_eq!(d[1], 2.0 * 0.75 - 0.5, 1e-15);
    }

    #[test]
    fn three_tank_conserves_flow() {
        let tanks = ThreeTank::default();
        let d = tanks.derivative(&DVector::from_vec(vec![0.25, 0.0, -1.0]));
        // Only tank 1 drains; an empty or negative level contributes nothing
        assert_approx_eq!(d[0], 0.3 - 0.2, 1e-15);
        assert_approx_eq!(d[1], 0.2, 1e-15);
        assert_eq!(d[2], 0.0);
        assert_approx_eq!(d.sum(), tanks.inflow, 1e-15);
    }

    #[test]
    fn rk4_matches_exponential_decay() {
        let x = rk4(&Decay, &DVector::from_vec(vec![1.0]), 1.0, RK4_SUBSTEPS);
        assert_approx_eq!(x[0], (-1.0f64).exp(), 1e-7);
    }

    #[test]
    fn training_set_is_reproducible() {
        let vdp = VanDerPol { mu: 1.0 };
        let x0 = vdp.default_initial_state();
        let a = generate_training_set(&vdp, &x0, 2.0, 25, 0.01, &mut StdRng::seed_from_u64(3))
            .unwrap();
        let b = generate_training_set(&vdp, &x0, 2.0, 25, 0.01, &mut StdRng::seed_from_u64(3))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.samples(), 25);
        assert_eq!(a.dimension(), 2);
    }

    #[test]
    fn noiseless_training_matches_vector_field() {
        let set = generate_training_set(
            &Decay,
            &DVector::from_vec(vec![1.0]),
            1.0,
            10,
            0.0,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        for i in 0..set.samples() {
            assert_eq!(set.derivatives()[(i, 0)], -set.states()[(i, 0)]);
        }
    }

    #[test]
    fn invalid_noise_is_reported() {
        let err = generate_training_set(
            &Decay,
            &DVector::from_vec(vec![1.0]),
            1.0,
            10,
            -1.0,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::InvalidTrainingData(_)));
    }

    #[test]
    fn closed_loop_tracks_van_der_pol() {
        let run = run_closed_loop(&quick_config()).unwrap();
        assert_eq!(run.results.len(), 20);
        assert_eq!(run.summary.system, "van-der-pol");
        assert!(run.results.iter().all(|r| r.updated));
        for r in &run.results {
            assert!(r.process_noise.iter().all(|q| q.is_finite() && *q >= 0.0));
            assert!(r.variance.iter().all(|v| *v > 0.0));
        }
        // Full-state measurements with std 0.05 keep the error well below the signal scale
        assert!(run.summary.rmse.iter().all(|e| *e < 0.5));
    }

    #[test]
    fn closed_loop_with_multitask_backend() {
        let config = SimulationConfig {
            backend: BackendKind::Multitask,
            system: SystemKind::ThreeTank,
            ..quick_config()
        };
        let run = run_closed_loop(&config).unwrap();
        assert_eq!(run.results[0].truth.len(), 3);
        assert!(run.summary.rmse.iter().all(|e| e.is_finite()));
    }

    #[test]
    fn wrong_initial_state_dimension() {
        let config = SimulationConfig {
            initial_state: vec![1.0, 2.0, 3.0],
            ..quick_config()
        };
        assert!(matches!(
            run_closed_loop(&config).unwrap_err(),
            FilterError::ShapeMismatch { expected: 2, got: 3, .. }
        ));
    }

    #[test]
    fn results_csv_layout() {
        let results = vec![FilterResult {
            step: 1,
            time: 0.05,
            truth: vec![1.0, 2.0],
            estimate: vec![1.1, 1.9],
            variance: vec![0.01, 0.02],
            process_noise: vec![0.001, 0.002],
            updated: true,
        }];
        let f = NamedTempFile::new().unwrap();
        write_results_csv(&results, f.path()).unwrap();
        let mut rdr = csv::Reader::from_path(f.path()).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(headers.len(), 11);
        assert_eq!(&headers[3], "truth_0");
        assert_eq!(&headers[10], "q_1");
        let row = rdr.records().next().unwrap().unwrap();
        assert_eq!(&row[2], "true");
        assert_eq!(row[6].parse::<f64>().unwrap(), 1.9);
    }
}
