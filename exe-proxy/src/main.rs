// Execution proxy: runs executables for workers on other hosts

use anyhow::Result;
use std::net::SocketAddr;

mod handlers;
mod middleware;
mod routes;
mod state;
mod tasks;

use common::config::Settings;
use common::telemetry;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Settings::load()?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        "exe-proxy",
        &config.observability.log_level,
        config.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = config.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let proxy = &config.exe_proxy;
    if proxy.api_key.is_none() {
        tracing::warn!("No API key configured, the proxy accepts unauthenticated requests");
    }
    tracing::info!(host = %proxy.host, port = %proxy.port, "Configuration loaded");

    let state = AppState::new(proxy.api_key.clone());
    let tasks = state.tasks.clone();
    let app = routes::create_router(state);

    let addr = SocketAddr::from((proxy.host.parse::<std::net::IpAddr>()?, proxy.port));
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.cancel_all();
    tracing::info!("Execution proxy stopped");
    telemetry::shutdown_tracer();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}
