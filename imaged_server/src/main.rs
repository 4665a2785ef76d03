//! imaged: single-slot Packer image build server.
//!
//! Accepts build requests over HTTP, runs Packer against a template
//! repository one build at a time, and records each build's status, log, and
//! produced files in PostgreSQL and S3.

mod config;
mod metrics;
mod migration;
mod models;
mod routes;
mod schema;
mod services;
mod storage;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::services::build_service::{self, PgBuildStore};
use crate::services::executor::Executor;
use crate::services::templates::TemplateRepo;
use crate::services::worker::Worker;
use crate::storage::S3ArtifactStore;

#[derive(Parser)]
#[command(name = "imaged", about = "Packer image build server")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "IMAGED_PORT", default_value = "8080")]
    port: u16,

    /// PostgreSQL connection URL
    #[arg(long, env = "IMAGED_DATABASE_URL")]
    database_url: String,

    /// S3 bucket that build records are uploaded to
    #[arg(long, env = "IMAGED_RECORD_BUCKET")]
    bucket: String,

    /// Create the database tables before serving
    #[arg(long, env = "IMAGED_RUN_MIGRATIONS")]
    migrate: bool,

    /// Log at debug level
    #[arg(long, env = "IMAGED_DEBUG")]
    debug: bool,

    /// Maximum database connections
    #[arg(long, env = "IMAGED_MAX_DB_CONNECTIONS", default_value = "5")]
    max_db_connections: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    tracing::info!("Starting imaged...");
    metrics::init_metrics();

    let pool = build_service::create_pool(&cli.database_url, cli.max_db_connections)?;
    if cli.migrate {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        tracing::info!("Running database migration...");
        migration::run_migration(&mut conn).await?;
        tracing::info!("Database migration completed.");
    }
    let store = Arc::new(PgBuildStore::new(pool));
    let storage = Arc::new(S3ArtifactStore::new(&cli.bucket)?);

    let worker_config = WorkerConfig::from_env()?;
    let templates = {
        let config = worker_config.clone();
        tokio::task::spawn_blocking(move || TemplateRepo::from_config(&config)).await??
    };
    tracing::info!(path = %templates.path().display(), "Template repository ready");

    let cancel = CancellationToken::new();
    let executor = Executor::new(
        store.clone(),
        storage.clone(),
        Arc::new(templates),
        &worker_config,
        cancel.clone(),
    );
    let (worker, run_loop) = Worker::new(executor, cancel.clone());
    let run_loop = tokio::spawn(run_loop.run());

    let app = routes::router(routes::AppState {
        store,
        storage,
        worker,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("imaged listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    tracing::info!("Waiting for the build worker to stop...");
    if let Err(e) = run_loop.await {
        tracing::error!("Build worker task failed: {e}");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_level.into())
    };

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

/// Resolve on SIGINT or SIGTERM and cancel in-flight work.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
    cancel.cancel();
}
