//! bbblb load balancer service.
//!
//! Entry point: loads configuration, runs migrations, wires the importer,
//! webhook forwarder and poller, then serves the HTTP surfaces until a
//! shutdown signal arrives. Shutdown drains background work in reverse
//! order of startup, bounded by timeouts.

use anyhow::Context;
use lb_service::config::Config;
use lb_service::observability::metrics::init_metrics_recorder;
use lb_service::recordings::importer::RecordingImporter;
use lb_service::recordings::storage::RecordingStorage;
use lb_service::routes::{build_routes, AppState};
use lb_service::services::Webhooks;
use lb_service::tasks::poller::run_poller;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},sqlx=warn,hyper=info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    // SIGTERM would be nice too, but ctrl_c covers containers with a proper
    // init and local runs alike.
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config);

    info!(domain = %config.domain, "Starting bbblb load balancer");

    let metrics = match init_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.db_uri)
        .await
        .context("failed to connect to the database")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let http = reqwest::Client::builder()
        .user_agent("bbblb")
        .build()
        .context("failed to build HTTP client")?;

    let cancel = CancellationToken::new();

    let webhooks = Webhooks::new(http.clone(), config.webhook_retry, cancel.child_token());

    let storage = Arc::new(RecordingStorage::new(config.recording_path.clone()));
    std::fs::create_dir_all(storage.basedir()).context("failed to create recording storage")?;
    let importer = Arc::new(RecordingImporter::new(
        pool.clone(),
        Arc::clone(&storage),
        webhooks.clone(),
        config.recording_threads,
        cancel.child_token(),
    ));

    let poller = tokio::spawn(run_poller(
        pool.clone(),
        http.clone(),
        config.clone(),
        cancel.child_token(),
    ));

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
        http,
        importer: Arc::clone(&importer),
        webhooks: webhooks.clone(),
        metrics,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!(address = %config.bind_address, "Listening");

    axum::serve(listener, build_routes(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down");
    cancel.cancel();
    importer.shutdown(Duration::from_secs(30)).await;
    webhooks.shutdown(Duration::from_secs(10)).await;
    if let Err(e) = poller.await {
        tracing::warn!(error = %e, "Poller task ended abnormally");
    }
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}
