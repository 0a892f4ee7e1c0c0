pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use cadence_ledger::Ledger;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;

pub use state::{AppState, LedgerMetrics, SharedState as SharedStateType};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(routes::health::health_check))
        // Prometheus metrics
        .route("/api/metrics", get(routes::metrics::get_metrics))
        // Configuration management
        .route(
            "/api/config",
            get(routes::config::get_config).put(routes::config::update_config),
        )
        // Bucket inspection
        .route("/api/buckets", get(routes::buckets::list_buckets))
        .route(
            "/api/buckets/{name}/entries",
            get(routes::buckets::list_entries),
        )
        .route(
            "/api/buckets/{name}/entries/{id}",
            delete(routes::buckets::delete_entry),
        )
        // Admission
        .route("/api/reserve", post(routes::reserve::reserve))
        // Attach shared state and middleware
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// Runs until `shutdown` resolves.
pub async fn run_admin_server(
    state: SharedState,
    listen_addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Convenience function to create a SharedState around a ledger.
pub fn new_shared_state(ledger: Ledger) -> SharedState {
    Arc::new(AppState::new(ledger))
}
