//! CLI entry point for shock_logger
//!
//! Run a logging session:
//! ```bash
//! shock_logger run --config config/shock_logger.toml
//! ```
//!
//! Check a configuration without touching a device:
//! ```bash
//! shock_logger check --config config/shock_logger.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shock_logger::config::{LoggerConfig, DEFAULT_CONFIG_PATH};
use shock_logger::logging;
use shock_logger::registry::ChannelRegistry;
use shock_logger::run::PreparedRun;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "shock_logger")]
#[command(about = "Continuous suspension and brake-pressure logger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, confirm, and log until Ctrl+C
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Start without waiting for ENTER
        #[arg(long, short)]
        yes: bool,
    },

    /// Validate configuration and print the channel table
    Check {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, yes } => run(config, yes).await,
        Commands::Check { config } => check(config),
    }
}

fn load(path: &Path) -> Result<LoggerConfig> {
    let config = LoggerConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init_from_config(&config)?;
    config.validate()?;
    Ok(config)
}

async fn run(path: PathBuf, yes: bool) -> Result<()> {
    let config = load(&path)?;

    println!("\nConnecting - please wait...");
    let prepared = PreparedRun::prepare(config).await.map_err(|e| {
        error!(error = %e, "Bring-up failed");
        e
    })?;
    println!("\n{}", prepared.describe());

    if !yes && !wait_for_enter().await? {
        prepared.abort().await?;
        println!("Aborted.");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping acquisition");
            let _ = shutdown_tx.send(true);
        }
    });

    println!("Logging... press Ctrl+C to stop");
    let report = prepared.execute(shutdown_rx).await.map_err(|e| {
        error!(error = %e, "Run failed");
        e
    })?;

    let summary = &report.summary;
    println!();
    println!("Raw:    {}", report.files.raw.display());
    println!("Mapped: {}", report.files.mapped.display());
    println!(
        "{} rows over {} polls at {} Hz ({} wraps, {} skipped polls)",
        summary.rows_written,
        summary.polls,
        report.actual_rate_hz,
        summary.wraps,
        summary.transient_anomalies
    );
    Ok(())
}

/// Block on ENTER; `false` if Ctrl+C comes first.
async fn wait_for_enter() -> Result<bool> {
    println!("\nHit ENTER to continue");
    let (tx, rx) = oneshot::channel();
    // Detached so an abort does not wait on a blocked stdin read.
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = tx.send(std::io::stdin().read_line(&mut line));
    });

    tokio::select! {
        read = rx => {
            read.context("stdin reader exited")??;
            Ok(true)
        }
        _ = tokio::signal::ctrl_c() => Ok(false),
    }
}

fn check(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let registry = ChannelRegistry::build(&config.acquisition, &config.calibration)?;
    let acq = &config.acquisition;

    println!("Configuration OK: {}", path.display());
    println!(
        "    Backend: {}; {} samples per channel at {} Hz; poll every {} ms; {:?}",
        acq.backend, acq.samples_per_channel, acq.rate_hz, acq.poll_interval_ms, acq.consumption
    );
    for binding in registry.bindings() {
        let record = &binding.record;
        println!(
            "    {:>3}  {:<13} {:<11} {:.3}-{:.3} V -> {}-{} {}  {}",
            record.channel_id,
            binding.input_mode,
            binding.range,
            record.voltage_domain.0,
            record.voltage_domain.1,
            record.unit_range.0,
            record.unit_range.1,
            record.unit,
            record.display_name_mapped
        );
    }
    println!("    Header: {}", registry.header().join(","));
    println!("    Output: {}", config.storage.output_dir.display());
    Ok(())
}
