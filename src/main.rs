//! Graceful router demo server.
//!
//! Serves a small router on every configured listener and drains it on
//! SIGINT/SIGTERM.
//!
//! ```text
//! graceful-router --config graceful.toml
//! graceful-router --addr :8080 --addr 127.0.0.1:9000
//! ```

use std::path::PathBuf;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};

use graceful_router::config::{load_config, GracefulConfig, ListenerConfig};
use graceful_router::lifecycle::{signals, BoxError};
use graceful_router::observability::{logging, metrics};
use graceful_router::{Error, Graceful, Listener, ShutdownContext, Timeouts};

#[derive(Parser)]
#[command(name = "graceful-router")]
#[command(about = "HTTP server with coordinated graceful shutdown", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional address to listen on (repeatable)
    #[arg(short, long = "addr")]
    addrs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GracefulConfig::default(),
    };
    config.listeners.extend(
        cli.addrs
            .iter()
            .map(|address| ListenerConfig::Addr { address: address.clone() }),
    );

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "graceful-router starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let router = Router::new()
        .route("/", get(|| async { "graceful-router" }))
        .route("/health", get(health));

    let graceful = Graceful::builder(router)
        .default_middleware()
        .timeouts(Timeouts::from_config(&config.timeouts))
        .listeners(config.listeners.iter().map(Listener::from_config))
        .before_shutdown("log-before", |ctx: ShutdownContext| async move {
            tracing::info!(remaining = ?ctx.remaining(), "Draining servers");
            Ok::<_, BoxError>(())
        })
        .after_shutdown("log-after", |_ctx: ShutdownContext| async move {
            tracing::info!("Servers drained");
            Ok::<_, BoxError>(())
        })
        .build()?;

    let result = graceful.run(signals::shutdown_token()).await;
    graceful.close().await;

    match result {
        Ok(()) | Err(Error::Canceled) => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Server stopped with an error");
            Err(e.into())
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
