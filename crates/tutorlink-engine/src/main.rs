//! Tutorlink engine service.
//!
//! Opens the store, runs the invitation expiration sweeper and exposes health and readiness endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutorlink_engine::{EngineConfig, ExpirationSweeper, TutoringService};
use tutorlink_store::{RocksStore, Store};

/// Application state shared across handlers.
struct AppState<S: Store + 'static> {
    tutoring: Arc<TutoringService<S>>,
    sweeper: Arc<ExpirationSweeper<S>>,
}

impl<S: Store + 'static> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            tutoring: Arc::clone(&self.tutoring),
            sweeper: Arc::clone(&self.sweeper),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "tutorlink-engine",
    })
}

async fn ready_handler<S: Store + 'static>(State(state): State<AppState<S>>) -> impl IntoResponse {
    if !state.sweeper.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "sweeper stopped");
    }
    match state.tutoring.store().list_topics() {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

fn create_router<S: Store + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler::<S>))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tutorlink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tutorlink engine");

    // Load configuration from environment
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "/data".to_string());
    let config = EngineConfig::from_env();

    let store = Arc::new(RocksStore::open(&data_dir)?);
    tracing::info!(data_dir = %data_dir, "Initialized RocksDB store");

    let sweeper = Arc::new(ExpirationSweeper::new(
        Arc::clone(&store),
        config.sweep_interval(),
    ));
    sweeper.start();

    let tutoring = Arc::new(TutoringService::new(
        store,
        tutorlink_engine::Collaborators::noop(),
        config,
    ));

    let app = create_router(AppState {
        tutoring,
        sweeper: Arc::clone(&sweeper),
    });

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop().await;
    tracing::info!("Tutorlink engine stopped");

    Ok(())
}
