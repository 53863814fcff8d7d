//! HTTP front door.

pub mod handlers;
pub mod protocol;

use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::engine::SeparationEngine;
use crate::error::{Result, SeparationError};
use crate::jobs::{CoordinatorSettings, JobCoordinator};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and the small text fields.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// How long shutdown waits for cancelled jobs to settle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AppState {
    pub coordinator: JobCoordinator,
    pub max_upload_bytes: u64,
    pub cors: bool,
}

impl AppState {
    pub fn new(coordinator: JobCoordinator, config: &crate::config::ServerConfig) -> Self {
        Self {
            coordinator,
            max_upload_bytes: config.max_upload_bytes,
            cors: config.cors,
        }
    }
}

/// Build the router with tracing, body limit and (optionally) CORS.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let cors = state.cors;

    let router = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/separate", post(handlers::separate))
        .route("/jobs/:id", get(handlers::job_status))
        .route("/jobs/:id/stems", get(handlers::job_archive))
        .route("/jobs/:id/stems/:stem", get(handlers::job_stem))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Open the cache, start loading the model, and serve until SIGINT/SIGTERM.
///
/// The listener is bound before the model finishes loading so `/health`
/// answers 503 during startup rather than refusing connections.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;

    let cache_root = config.cache.resolved_dir();
    let max_bytes = config.cache.max_bytes;
    let cache = tokio::task::spawn_blocking(move || ArtifactCache::open(&cache_root, max_bytes))
        .await
        .map_err(|e| SeparationError::Other(format!("cache open task failed: {}", e)))??;

    let engine = Arc::new(SeparationEngine::new());
    let loader = engine.load_in_background(config.engine.clone());

    let coordinator = JobCoordinator::new(
        Arc::clone(&engine),
        cache,
        CoordinatorSettings::from(&config.jobs),
    );
    coordinator.start_reaper();

    let state = AppState::new(coordinator.clone(), &config.server);
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        workers = coordinator.settings().workers,
        backend = ?config.engine.backend,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    loader.abort();
    coordinator.shutdown(SHUTDOWN_GRACE).await;
    engine.shutdown();
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let sigterm = async {
        if let Err(e) = wait_for_sigterm().await {
            tracing::error!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to listen for SIGINT");
            }
            tracing::info!("received SIGINT");
        }
        _ = sigterm => {
            tracing::info!("received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| SeparationError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await
}
