//! CLI Entry Point for rust_scope
//!
//! Provides command-line interface for:
//! - Running an experiment spec against the configured devices
//! - Printing the action table a spec builds to, without touching hardware
//! - Checking a configuration file
//!
//! # Usage
//!
//! ```bash
//! rust_scope run --config config/scope.toml --spec config/zstack_488.toml
//! rust_scope plan --spec config/zstack_488.toml
//! rust_scope check-config --config config/scope.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_scope::config::ScopeConfig;
use rust_scope::events::EventBus;
use rust_scope::experiment::{ExperimentEngine, ExperimentSpec, RunStatus, TargetHandle};
use rust_scope::hardware::DeviceRegistry;
use rust_scope::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_scope")]
#[command(about = "Hardware-timed microscope experiment runner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/scope.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment spec; Ctrl-C aborts the run
    Run {
        /// Path to the experiment spec (TOML)
        #[arg(long)]
        spec: PathBuf,
    },

    /// Build the action table for a spec and print it
    Plan {
        /// Path to the experiment spec (TOML)
        #[arg(long)]
        spec: PathBuf,

        /// Only show entries for this device
        #[arg(long)]
        device: Option<String>,
    },

    /// Validate the configuration and list devices
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ScopeConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let events = EventBus::default();
    let registry = Arc::new(DeviceRegistry::from_config(&config, &events).await?);

    match cli.command {
        Commands::Run { spec } => run_experiment(registry, config, spec).await,
        Commands::Plan { spec, device } => plan_experiment(registry, config, spec, device),
        Commands::CheckConfig => {
            for device in registry.list_devices() {
                println!(
                    "{:<16} {:<12} {:?}",
                    device.id, device.driver_type, device.capabilities
                );
            }
            println!("configuration ok: {} device(s)", registry.len());
            Ok(())
        }
    }
}

async fn run_experiment(
    registry: Arc<DeviceRegistry>,
    config: ScopeConfig,
    spec_path: PathBuf,
) -> Result<()> {
    let spec = ExperimentSpec::load(&spec_path)?;
    let engine = ExperimentEngine::new(registry, config);

    let handle = engine.start(spec).await?;
    info!(run_id = handle.run_id(), "Run started");

    let abort_engine = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting run");
            abort_engine.abort();
        }
    });

    let result = handle.wait().await?;
    ctrl_c.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.status != RunStatus::Completed {
        anyhow::bail!(
            "run {} {}: {}",
            result.run_id,
            result.status,
            result.error.as_deref().unwrap_or("no reason recorded")
        );
    }
    Ok(())
}

fn plan_experiment(
    registry: Arc<DeviceRegistry>,
    config: ScopeConfig,
    spec_path: PathBuf,
    device: Option<String>,
) -> Result<()> {
    let spec = ExperimentSpec::load(&spec_path)?;
    let engine = ExperimentEngine::new(registry, config);
    let built = engine.plan(&spec)?;

    let filter = device.map(TargetHandle::Device);
    println!("{}", built.table.pretty_string(filter.as_ref()));
    println!(
        "{} entries, {} slots per pass, {} pass(es), {:?} per pass",
        built.table.len(),
        built.acquisition.len(),
        built.table.repeat_count(),
        built.table.total_duration()
    );
    Ok(())
}
