//! GPFILTER SIM: closed-loop simulation of unscented filtering with learned dynamics.
//!
//! A Gaussian-process model of the system's vector field is fitted on synthetic data, then used
//! as both the transition function and the process-noise source of an unscented Kalman filter
//! that tracks the true system through noisy full-state measurements.
//!
//! Parameters come from a configuration file (TOML/JSON/YAML), with a few command-line overrides.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

use gpfilter::backend::BackendKind;
use gpfilter::config::SimulationConfig;
use gpfilter::sim::{run_closed_loop, write_results_csv};

#[derive(Parser)]
#[command(author, version, about = "Unscented filtering with Gaussian-process dynamics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Fit a model and run the closed-loop filter
    Run(RunArgs),
    /// Write a default configuration file
    InitConfig {
        /// Destination (.toml, .json, .yaml or .yml)
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Configuration file (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Output CSV file for per-step results
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Override the number of filter steps
    #[arg(long)]
    steps: Option<usize>,
    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,
    /// Override the regression backend
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,
}

fn parse_backend(s: &str) -> std::result::Result<BackendKind, String> {
    match s.to_lowercase().as_str() {
        "independent" => Ok(BackendKind::Independent),
        "multitask" => Ok(BackendKind::Multitask),
        other => Err(format!("unknown backend '{other}', expected independent or multitask")),
    }
}

/// Initialize the logger with the specified configuration
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn run(args: &RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    info!(
        "Running {} steps of {:?} with the {:?} backend",
        config.steps, config.system, config.backend
    );
    let run = run_closed_loop(&config).context("closed-loop simulation failed")?;
    for (i, rmse) in run.summary.rmse.iter().enumerate() {
        info!("State {}: RMSE {:.5}", i, rmse);
    }
    if let Some(output) = &args.output {
        write_results_csv(&run.results, output)
            .with_context(|| format!("writing results to {}", output.display()))?;
        info!("Results written to {}", output.display());
    }
    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    SimulationConfig::default()
        .to_file(output)
        .with_context(|| format!("writing configuration to {}", output.display()))?;
    info!("Default configuration written to {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    match &cli.command {
        Command::Run(args) => run(args),
        Command::InitConfig { output } => init_config(output),
    }
}
