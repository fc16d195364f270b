#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::Result;
use clap::Parser;
use nmearouter::config::Config;
use nmearouter::console::LogControl;
use nmearouter::router::{ControlSignal, Router};
use nmearouter::state::FilePortStore;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

/// Exit code asking a supervisor wrapper to start us again.
const RESTART_EXIT_CODE: i32 = 86;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nmea-router.toml")]
    config: String,

    /// Keep persisted port bindings even when the configuration changed
    #[arg(short, long)]
    force_port_config: bool,

    /// Override the resolution timeout in milliseconds
    #[arg(long)]
    resolv_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter_layer, reload_handle) =
        reload::Layer::new(EnvFilter::try_new(&base).unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let log = LogControl::new(reload_handle, &base);

    let args = Args::parse();

    info!(
        "nmea-router {} starting with config: {}",
        env!("CARGO_PKG_VERSION"),
        args.config
    );

    let mut config = match Config::load(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            error!("error loading config: {e:#}");
            return Err(e.into());
        }
    };
    if let Some(ms) = args.resolv_timeout {
        config.general.resolv_timeout_ms = ms;
    }
    info!("loaded configuration with {} endpoints", config.endpoint.len());

    let store = Arc::new(FilePortStore::open(&config.general.state_file));
    let (router, mut signals) =
        Router::start(config, store, log, args.force_port_config).await?;

    let mut exit_code = 0;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
        sig = signals.recv() => match sig {
            Some(ControlSignal::Shutdown) | None => info!("shutdown requested"),
            Some(ControlSignal::Restart) => {
                info!("restart requested");
                exit_code = RESTART_EXIT_CODE;
            }
            Some(ControlSignal::Fatal(msg)) => {
                router.stop().await;
                anyhow::bail!("fatal: {msg}");
            }
        }
    }

    router.stop().await;
    info!("shutdown complete");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
