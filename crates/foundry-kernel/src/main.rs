//! `foundry` command line: simulation and configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foundry_core::FoundryConfig;
use foundry_kernel::simulator::{run_simulator, SimulatorConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foundry", version, about = "Iterative build/test/refine workflow engine")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run seeded synthetic workflows through the engine and check invariants
    Simulate {
        /// Number of workflows to submit
        #[arg(long, default_value_t = 10)]
        workflows: usize,
        /// Components per design
        #[arg(long, default_value_t = 3)]
        modules: usize,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Refine cycles before a module fails (overrides the config file)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Chance that the refiner fixes a broken file
        #[arg(long, default_value_t = 0.6)]
        fix_probability: f64,
        /// Chance that a test run fails transiently
        #[arg(long, default_value_t = 0.02)]
        error_probability: f64,
        /// Run the watchdog alongside the engine
        #[arg(long)]
        watchdog: bool,
        /// Seconds to wait for each workflow
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Configuration file; defaults apply when omitted
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<FoundryConfig> {
    match path {
        Some(path) => FoundryConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(FoundryConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Simulate {
            workflows,
            modules,
            seed,
            max_iterations,
            fix_probability,
            error_probability,
            watchdog,
            timeout_secs,
            config,
            json,
        } => {
            let mut foundry = load_config(config.as_ref())?;
            if let Some(max) = max_iterations {
                foundry = foundry.with_max_iterations(max);
            }
            foundry.validate().context("invalid configuration")?;
            anyhow::ensure!(
                (0.0..=1.0).contains(&fix_probability) && (0.0..=1.0).contains(&error_probability),
                "probabilities must lie in [0, 1]"
            );

            let report = run_simulator(SimulatorConfig {
                seed,
                workflows,
                modules,
                fix_probability,
                error_probability,
                watchdog,
                timeout: Duration::from_secs(timeout_secs),
                foundry,
            })
            .await
            .context("simulation aborted")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Command::Config { path } => {
            let config = load_config(path.as_ref())?;
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
