//! Skydock — deployment pipeline orchestrator.
//!
//! Turns GitHub push/PR-merge/release events into running Kubernetes
//! workloads through a cloud provider's source-mirror, build, deploy and
//! pipeline services, with rollback and realtime progress over WebSocket.

mod config;
mod db;
mod error;
mod hub;
mod metrics;
mod migration;
mod models;
mod routes;
mod schema;
mod services;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use crate::services::orchestrator::Orchestrator;
use crate::services::rollback::RollbackService;

#[derive(Parser)]
#[command(name = "skydock", about = "Skydock deployment orchestrator")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "SKYDOCK_PORT", default_value = "8080")]
    port: u16,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting Skydock server...");

    let mut config = config::AppConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let pool = db::build_pool(&config.database_url)?;
    {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        tracing::info!("Running database migration...");
        migration::run_migration(&mut conn).await?;
    }

    let hub = Arc::new(hub::Hub::new());
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), pool.clone(), hub.clone()));
    let rollback = Arc::new(RollbackService::new(
        config.clone(),
        pool.clone(),
        orchestrator.deploy_service(),
        hub.clone(),
        orchestrator.provider.clone(),
    ));

    let app = routes::app_router(routes::AppState {
        orchestrator,
        rollback,
    })
    .layer(tower_http::trace::TraceLayer::new_for_http())
    .layer(tower_http::cors::CorsLayer::permissive());

    metrics::init_metrics();

    // Host comes from SKYDOCK_BIND_ADDRESS, port from the CLI.
    let mut addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}: {e}", config.bind_address))?;
    addr.set_port(cli.port);
    tracing::info!("Skydock listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
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
}
