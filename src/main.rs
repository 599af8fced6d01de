//! Subject Optimizer - subject-line bandit server
//!
//! REST API for generating subject-line tests, serving variants and tracking
//! outcomes.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{error, info, warn};

use subject_optimizer::config::{self, LogFormat, ServerConfig};
use subject_optimizer::handlers::{build_router, ExperimentManager};
use subject_optimizer::{metrics, middleware, tracing_setup};

/// Max time to drain in-flight requests after a shutdown signal
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|a| a == "--help" || a == "-h") {
        config::print_env_help();
        return Ok(());
    }

    if let Err(e) = tracing_setup::init_tracing(LogFormat::from_env()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register metrics: {}", e);
    }

    let server_config = ServerConfig::from_env();
    server_config.log();

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid bind address {}:{}",
                server_config.host, server_config.port
            )
        })?;
    let max_concurrent = server_config.max_concurrent_requests;
    let cors = server_config.cors.to_layer();

    let manager = {
        let config = server_config.clone();
        tokio::task::spawn_blocking(move || ExperimentManager::new(config))
            .await
            .context("Manager startup panicked")??
    };
    let manager = Arc::new(manager);

    info!("Concurrency limiting enabled: max_concurrent={}", max_concurrent);

    // Global layers wrap every route, probes included
    let app = build_router(manager.clone())
        .layer(axum::middleware::from_fn(middleware::track_metrics))
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Close the store on the blocking pool; RocksDB flushes its memtables on drop
    let close = tokio::task::spawn_blocking(move || drop(manager));
    match tokio::time::timeout(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS), close).await {
        Ok(_) => info!("Server shutdown complete"),
        Err(_) => {
            error!(
                "Graceful shutdown timed out after {}s, forcing exit",
                GRACEFUL_SHUTDOWN_TIMEOUT_SECS
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Handle graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received, starting graceful shutdown");
}
