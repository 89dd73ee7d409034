//! Queueless - location-aware virtual queue engine
//!
//! Issues ordered tokens for physical service points, verifies holder
//! presence against a geofence, assigns tokens to counters, and
//! broadcasts every committed transition per service.
//!
//! Module structure:
//! - `domain/` - Core business types (Token, Service, Counter, geofence)
//! - `io/` - External interfaces (HTTP API, change event broadcast)
//! - `services/` - Business logic (Ledger, Admission, Presence, Dispatcher, Sweeper)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use queueless::infra::{Config, Metrics};
use queueless::io::{start_api_server, ApiContext, EventHub};
use queueless::services::{Sweeper, TokenLedger};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Queueless - virtual queue admission and lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "queueless", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "queueless starting");

    // Parse command line arguments using clap
    let args = Args::parse();

    // Load configuration from TOML file
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        near_threshold = %config.near_threshold(),
        called_timeout_secs = %config.called_timeout().as_secs(),
        max_wait_secs = %config.max_wait().as_secs(),
        sweep_interval_secs = %config.sweep_interval().as_secs(),
        api_port = %config.api_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let events = Arc::new(EventHub::new(config.events_channel_capacity()));
    let ledger = Arc::new(TokenLedger::new(&config, events, metrics.clone()));

    // Start the timeout sweeper
    let sweeper = Sweeper::new(&config, ledger.clone(), metrics.clone());
    let sweeper_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    });

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run the API server in the foreground until shutdown
    let api_port = config.api_port();
    if api_port > 0 {
        let ctx = Arc::new(ApiContext::new(&config, ledger, metrics));
        if let Err(e) =
            start_api_server(config.api_bind_address(), api_port, ctx, shutdown_rx).await
        {
            tracing::error!(error = %e, "API server error");
        }
    } else {
        // Headless mode: the engine is driven in-process; wait for shutdown
        let mut rx = shutdown_rx;
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    info!("queueless shutdown complete");
    Ok(())
}
