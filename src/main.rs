use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use initial_sync::sync::SyncConfig;
use metrics::server::{run_metrics_server, MetricsServerConfig};
use metrics::Metrics;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod simulation;

use simulation::SimulationConfig;

#[derive(Parser, Debug)]
struct Args {
    /// Number of simulated peers.
    #[arg(long, default_value_t = 8)]
    peers: usize,

    /// Peers whose head trails the canonical chain by a few epochs.
    #[arg(long, default_value_t = 2)]
    lagging_peers: usize,

    #[arg(long, default_value_t = 2048)]
    chain_length: u64,

    /// Epochs between a peer's head and its finalized checkpoint.
    #[arg(long, default_value_t = 2)]
    finalized_distance: u64,

    #[arg(long, default_value_t = 0.1)]
    skip_probability: f64,

    /// Probability that a simulated request fails.
    #[arg(long, default_value_t = 0.05)]
    failure_probability: f64,

    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    #[arg(long, default_value_t = 64)]
    batch_size: u64,

    #[arg(long, default_value_t = 384)]
    stale_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    min_peers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long)]
    metrics_address: Option<IpAddr>,

    #[arg(long, default_value_t = 5054)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let metrics = match args.metrics_address {
        Some(metrics_address) => {
            let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
            let config = MetricsServerConfig { metrics_address, metrics_port: args.metrics_port };
            let server_metrics = metrics.clone();
            task::spawn(async move {
                if let Err(error) = run_metrics_server(config, server_metrics).await {
                    error!(%error, "Metrics server exited");
                }
            });
            Some(metrics)
        }
        None => None,
    };

    let cancellation = CancellationToken::new();
    let shutdown = cancellation.clone();
    task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping sync");
            shutdown.cancel();
        }
    });

    let sync = SyncConfig::new()
        .with_batch_size(args.batch_size)
        .with_stale_timeout(Duration::from_secs(args.stale_timeout_secs))
        .with_minimum_sync_peers(args.min_peers);

    let config = SimulationConfig {
        peers: args.peers,
        lagging_peers: args.lagging_peers,
        chain_length: args.chain_length,
        finalized_distance: args.finalized_distance,
        skip_probability: args.skip_probability.clamp(0.0, 1.0),
        failure_probability: args.failure_probability.clamp(0.0, 1.0),
        latency: Duration::from_millis(args.latency_ms),
        seed: args.seed,
        sync,
    };

    let report = simulation::run(config, metrics, cancellation).await?;

    info!(
        head_slot = %report.head_slot,
        canonical_head_slot = %report.canonical_head_slot,
        imported_blocks = report.imported_blocks,
        skipped_blocks = report.stats.skipped_blocks,
        rejected_blocks = report.stats.rejected_blocks,
        elapsed = ?report.elapsed,
        "Simulation finished"
    );

    Ok(())
}
