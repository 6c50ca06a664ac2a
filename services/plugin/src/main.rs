//! ofplugin entry point
//!
//! Runs the full connection → collection pipeline against an in-memory
//! datastore and a simulated switch fabric.

use anyhow::{Context, Result};
use clap::Parser;
use ofplugin::{PluginProvider, SimulatorConfig, SwitchSimulator};
use plugin_config::{LoggingConfig, PluginConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use txchain::MemoryDataBroker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulated switches
    #[arg(short, long, default_value_t = 4)]
    switches: usize,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Open a second connection for every switch
    #[arg(long)]
    duplicate_connections: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown(duration: Option<Duration>) -> Result<()> {
    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => info!("Run duration elapsed"),
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl+C")?;
                    info!("Shutdown signal received");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PluginConfig::load(args.config.as_deref()).context("Failed to load plugin configuration")?;
    init_tracing(&config.logging);

    info!("Starting ofplugin v{}", env!("CARGO_PKG_VERSION"));

    let broker = MemoryDataBroker::new();
    let simulator = Arc::new(SwitchSimulator::new(SimulatorConfig {
        switches: args.switches,
        duplicate_connections: args.duplicate_connections,
        ..Default::default()
    }));

    let provider = PluginProvider::builder()
        .config(config)
        .data_broker(Arc::new(broker.clone()))
        .device_rpc(simulator.clone())
        .connection_provider(simulator.clone())
        .build();

    let coordinator = provider
        .initialize()
        .await
        .context("Failed to initialize plugin")?;

    wait_for_shutdown(args.duration_secs.map(Duration::from_secs)).await?;

    let lifecycle = coordinator.metrics();
    let statistics = coordinator.statistics().metrics();
    let registry = coordinator.registry().metrics();
    provider.close().await;

    info!(
        connected = lifecycle.connected,
        conflicts = lifecycle.conflicts,
        managers_created = registry.managers_created,
        cycles_completed = statistics.cycles_completed,
        stale_responses = statistics.stale_responses,
        requests_answered = simulator.requests_answered(),
        commits = broker.commit_count(),
        "ofplugin stopped"
    );

    Ok(())
}
