//! servesim CLI: simulate LLM serving clusters without GPUs.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use servesim_core::config::{SimConfig, WorkloadSection};
use servesim_core::{metrics, trace, workload, ConfigError, PolicyKind, SimError, TraceError};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "servesim",
    about = "Simulate LLM inference serving clusters without GPUs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulation.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// JSONL trace replacing the configured workload.
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Write metrics as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the same workload under several policies.
    Compare {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// JSONL trace replacing the configured workload.
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Comma-separated scheduler names.
        #[arg(long, value_delimiter = ',', group = "policies")]
        schedulers: Vec<String>,
        /// Comma-separated routing policy names.
        #[arg(long, value_delimiter = ',', group = "policies")]
        routers: Vec<String>,
        /// Comma-separated admission policy names.
        #[arg(long, value_delimiter = ',', group = "policies")]
        admission: Vec<String>,
        /// Comma-separated priority policy names.
        #[arg(long, value_delimiter = ',', group = "policies")]
        priorities: Vec<String>,
        /// Write metrics as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a synthetic JSONL trace.
    GenTrace {
        /// Request rate (requests/sec).
        #[arg(long, default_value = "100")]
        rate: f64,
        /// Number of requests.
        #[arg(long, default_value = "1000")]
        num_requests: usize,
        /// Random seed.
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Mean input tokens.
        #[arg(long, default_value = "100")]
        input_mean: f64,
        /// Std dev of input tokens.
        #[arg(long, default_value = "20")]
        input_std: f64,
        /// Mean output tokens.
        #[arg(long, default_value = "50")]
        output_mean: f64,
        /// Std dev of output tokens.
        #[arg(long, default_value = "10")]
        output_std: f64,
        /// Number of shared-prefix groups.
        #[arg(long, default_value = "0")]
        prefix_groups: u32,
        /// Shared prefix length in blocks.
        #[arg(long, default_value = "0")]
        prefix_blocks: u32,
        /// Comma-separated SLO classes, cycled over requests.
        #[arg(long, value_delimiter = ',')]
        slo_classes: Vec<String>,
        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Sweep arrival rates on the configured synthetic workload.
    Sweep {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated list of request rates.
        #[arg(long, value_delimiter = ',', required = true)]
        rates: Vec<f64>,
        /// Write metrics as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available policies.
    ListPolicies,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize results: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(String),
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("servesim=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Run {
            config,
            trace: trace_path,
            output,
        } => {
            let sim_config = SimConfig::from_file(&config)?;
            let requests = workload::load_requests(&sim_config, trace_path.as_deref())?;
            let result = servesim_core::run_simulation(sim_config, requests)?;
            println!("{}", metrics::format_table(&result));
            if let Some(path) = output {
                write_json(&path, &result)?;
            }
        }
        Commands::Compare {
            config,
            trace: trace_path,
            schedulers,
            routers,
            admission,
            priorities,
            output,
        } => {
            let sim_config = SimConfig::from_file(&config)?;
            let requests = workload::load_requests(&sim_config, trace_path.as_deref())?;
            let (kind, names) = if !schedulers.is_empty() {
                (PolicyKind::Scheduler, schedulers)
            } else if !routers.is_empty() {
                (PolicyKind::Routing, routers)
            } else if !admission.is_empty() {
                (PolicyKind::Admission, admission)
            } else if !priorities.is_empty() {
                (PolicyKind::Priority, priorities)
            } else {
                return Err(CliError::Usage(
                    "compare needs one of --schedulers, --routers, --admission, --priorities"
                        .to_string(),
                ));
            };
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let results = servesim_core::compare_policies(&sim_config, &requests, kind, &names)?;
            println!("{}", metrics::format_comparison_table(&results));
            if let Some(path) = output {
                write_json(&path, &results)?;
            }
        }
        Commands::GenTrace {
            rate,
            num_requests,
            seed,
            input_mean,
            input_std,
            output_mean,
            output_std,
            prefix_groups,
            prefix_blocks,
            slo_classes,
            output,
        } => {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(CliError::Usage(format!("--rate must be > 0, got {rate}")));
            }
            let defaults = WorkloadSection::default();
            let section = WorkloadSection {
                rate_per_sec: rate,
                num_requests,
                input_tokens_mean: input_mean,
                input_tokens_std: input_std,
                input_tokens_min: 1,
                input_tokens_max: (input_mean + 4.0 * input_std).max(1.0) as u32,
                output_tokens_mean: output_mean,
                output_tokens_std: output_std,
                output_tokens_min: 1,
                output_tokens_max: (output_mean + 4.0 * output_std).max(1.0) as u32,
                prefix_groups,
                prefix_blocks,
                slo_classes,
                ..defaults
            };
            let records = workload::generate_records(&section, seed);
            trace::write_jsonl(&records, &output)?;
            info!(requests = records.len(), path = %output.display(), "trace written");
        }
        Commands::Sweep {
            config,
            rates,
            output,
        } => {
            let sim_config = SimConfig::from_file(&config)?;
            let results = servesim_core::sweep_rates(&sim_config, &rates)?;
            for (rate, result) in rates.iter().zip(&results) {
                println!(
                    "Rate {:.0} req/s: TTFT p50={:.1}ms p99={:.1}ms | E2E p50={:.1}ms | {:.1} req/s | rejected {} | preemptions {}",
                    rate,
                    result.ttft_ms.p50,
                    result.ttft_ms.p99,
                    result.e2e_ms.p50,
                    result.requests_per_sec,
                    result.rejected,
                    result.preemptions,
                );
            }
            if let Some(path) = output {
                write_json(&path, &results)?;
            }
        }
        Commands::ListPolicies => {
            let sections = [
                ("Admission policies", servesim_policies::available_admission()),
                ("Routing policies", servesim_policies::available_routing()),
                ("Schedulers", servesim_policies::available_schedulers()),
                ("Priority policies", servesim_policies::available_priorities()),
            ];
            for (title, names) in sections {
                println!("{title}:");
                for name in names {
                    println!("  - {name}");
                }
            }
        }
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|source| CliError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    println!("Results written to {}", path.display());
    Ok(())
}
