//! Query server - read path of the monitoring backend
//!
//! Serves snapshot, series and summary queries over the metrics store,
//! plus status, incidents and Prometheus metrics.

use anyhow::Result;
use query_lib::{create_store, IncidentBoard, IngestStats, QueryService, StructuredLogger};
use query_server::{api, config::ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting query-server");

    let config = ServerConfig::load()?;
    info!(
        listen = %config.listen_addr(),
        store = ?config.store,
        max_connections = config.max_connections,
        query_timeout_secs = config.query_timeout_secs,
        "Server configured"
    );

    let store = create_store(config.store, &config.database_url, config.max_connections)?;
    let logger = StructuredLogger::new("query-server");
    let service = QueryService::new(store, Duration::from_secs(config.query_timeout_secs))
        .with_logger(logger.clone());

    let app_state = Arc::new(api::AppState::new(
        service,
        Arc::new(IngestStats::new()),
        Arc::new(IncidentBoard::new()),
    ));

    logger.log_startup(SERVER_VERSION, &config.listen_addr(), &format!("{:?}", config.store));

    let shutdown_logger = logger.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        shutdown_logger.log_shutdown("SIGINT received");
    };

    api::serve(config.listen_addr(), app_state, shutdown).await?;
    info!("Shut down");

    Ok(())
}
