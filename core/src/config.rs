//! Closed-loop simulation configuration.
//!
//! A [SimulationConfig] bundles everything needed to reproduce a run: which system generates the
//! truth, how the training set is sampled, how the regression backend is fitted, and how the
//! filter is tuned. Configurations can be written to and read from JSON, YAML, or TOML; the
//! format is picked from the file extension.

use crate::backend::{BackendKind, FitOptions};
use crate::noise::NoiseScaling;
use crate::normalize::NormalizationKind;
use crate::sim::SystemKind;
use crate::unscented::UnscentedParameters;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

fn default_seed() -> u64 {
    42
}

/// Configuration for a closed-loop simulation run.
///
/// ## Example
///
/// ```
/// use gpfilter::config::SimulationConfig;
/// use gpfilter::sim::SystemKind;
///
/// let cfg = SimulationConfig {
///     system: SystemKind::VanDerPol { mu: 0.5 },
///     steps: 100,
///     ..SimulationConfig::default()
/// };
/// assert_eq!(cfg.seed, 42);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of filter steps
    pub steps: usize,
    /// Filter step length (s)
    pub dt: f64,
    /// Seed for training and measurement noise
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of (state, derivative) pairs used for training
    pub training_samples: usize,
    /// Standard deviation of the noise added to training derivatives
    pub training_noise_std: f64,
    /// Standard deviation of the full-state measurement noise
    pub measurement_noise_std: f64,
    /// Fuse a measurement every this many steps; 0 disables updates
    pub measurement_interval: usize,
    /// Initial truth state; empty means the system's default
    pub initial_state: Vec<f64>,
    /// Initial filter variance on every state
    pub initial_variance: f64,
    pub backend: BackendKind,
    pub normalization: NormalizationKind,
    pub noise_scaling: NoiseScaling,
    pub system: SystemKind,
    pub fit: FitOptions,
    pub unscented: UnscentedParameters,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            steps: 200,
            dt: 0.05,
            seed: default_seed(),
            training_samples: 120,
            training_noise_std: 0.01,
            measurement_noise_std: 0.05,
            measurement_interval: 1,
            initial_state: Vec::new(),
            initial_variance: 0.01,
            backend: BackendKind::default(),
            normalization: NormalizationKind::ZScore,
            noise_scaling: NoiseScaling::default(),
            system: SystemKind::default(),
            fit: FitOptions::default(),
            unscented: UnscentedParameters::default(),
        }
    }
}
impl SimulationConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(p: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported file extension: {}", p.display()),
    )
}
