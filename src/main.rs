//! RPC Shield
//!
//! Runs the resilience layer against the configured endpoints, probing their
//! health and logging periodic statistics until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpc_shield::{ShieldClient, ShieldConfig};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "rpc-shield.toml", env = "RPC_SHIELD_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Interval between statistics reports
    #[arg(long, default_value = "60")]
    stats_interval_secs: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    init_logging(args.verbose, args.json_logs);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting RPC shield");

    let config = load_config(&args.config)?;

    if let Some(Command::Check) = args.command {
        config
            .validate()
            .context("configuration is invalid")?;
        info!(endpoints = config.endpoints.len(), "Configuration is valid");
        return Ok(());
    }

    let client = ShieldClient::connect(config).context("failed to start RPC shield")?;
    client.start();

    run_until_interrupted(&client, Duration::from_secs(args.stats_interval_secs.max(1))).await;

    client.shutdown().await;
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        "rpc_shield=debug,info"
    } else {
        "rpc_shield=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Load configuration from file and environment
fn load_config(path: &str) -> Result<ShieldConfig> {
    let mut config = if std::path::Path::new(path).exists() {
        ShieldConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config from {}", path))?
    } else {
        warn!(path = %path, "Config file not found, using environment only");
        ShieldConfig::from_urls(&[])
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    Ok(config)
}

async fn run_until_interrupted(client: &ShieldClient, stats_every: Duration) {
    let mut health_events = client.subscribe_health_events();
    let mut stats_interval = tokio::time::interval(stats_every);
    stats_interval.tick().await;

    loop {
        tokio::select! {
            event = health_events.recv() => match event {
                Ok(event) => info!(
                    url = %event.url,
                    from = ?event.old_status,
                    to = ?event.new_status,
                    at = %event.timestamp,
                    "Endpoint health changed"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Health events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            _ = stats_interval.tick() => {
                let stats = client.get_stats();
                info!(
                    healthy = stats.pool.healthy_endpoints,
                    unhealthy = stats.pool.unhealthy_endpoints,
                    in_flight = stats.pool.in_flight,
                    queued = stats.pool.queued,
                    open_circuits = stats.breaker.open,
                    cache_hit_rate = stats.cache.hit_rate,
                    batch_physical_calls = stats.batch.physical_calls,
                    "Statistics"
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }
}
