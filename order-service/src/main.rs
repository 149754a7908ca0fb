mod api;
mod config;
mod db;
mod middleware;
mod models;
mod schema;
mod store;
mod tasks;
mod telemetry;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use crate::config::Config;
use crate::store::PgOrderStore;
use crate::tasks::BackgroundTasks;
use crate::telemetry::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let identity = config.identity();
    let tracing_guard = telemetry::init_tracing(&config.otlp_endpoint, &identity.version);

    info!("Connecting to database at {}:{}...", config.db_host, config.db_port);
    let pool = match db::connect(&config.database_url(), config.pool_settings(), config.retry_policy()).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("{}", e);
            tracing_guard.shutdown();
            return Err(e.into());
        }
    };

    let metrics = Metrics::new().context("failed to register metrics")?;
    let tasks = Arc::new(BackgroundTasks::start(
        tasks::QUEUE_CAPACITY,
        tasks::MAX_CONCURRENT_JOBS,
        tasks::INVENTORY_CHECK_DELAY,
    ));

    let app_state = api::AppState {
        store: Arc::new(PgOrderStore::new(pool)),
        tasks: tasks.clone(),
        metrics,
        identity: identity.clone(),
    };
    let app = api::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Order Service {} starting on port {}", identity.version, config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Queued and in-flight inventory checks are abandoned here.
    info!(completed = tasks.completed(), "Order service stopped");
    tracing_guard.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
