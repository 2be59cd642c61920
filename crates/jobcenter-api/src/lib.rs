//! jobcenter-api: HTTP statistics endpoints.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v1/workmachines/workload` | Used and free resources per machine |
//! | GET | `/v1/workmachines/{uid}` | Jobs currently on a machine |
//! | GET | `/v1/jobs/{uid}` | One job |
//! | GET | `/v1/jobs/hours/{n}` | Jobs active during the last `n` hours |
//! | GET | `/v1/user/{name}/jobs` | Jobs owned by a user |
//!
//! Bodies are YAML (`application/x-yaml`). Anything else is a 404.

pub mod handlers;

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use jobcenter_state::Database;
use tokio::sync::watch;
use tracing::info;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
}

pub fn build_router(db: Database) -> Router {
    let state = ApiState { db };
    Router::new()
        .route("/v1/workmachines/workload", get(handlers::workload))
        .route("/v1/workmachines/{uid}", get(handlers::machine_jobs))
        .route("/v1/jobs/hours/{n}", get(handlers::recent_jobs))
        .route("/v1/jobs/{uid}", get(handlers::get_job))
        .route("/v1/user/{name}/jobs", get(handlers::user_jobs))
        .fallback(handlers::not_found)
        .with_state(state)
}

/// Serve the API on `0.0.0.0:port` until `shutdown` fires.
pub async fn serve(
    db: Database,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "statistics API listening");
    axum::serve(listener, build_router(db))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
