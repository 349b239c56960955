//! Application setup and server configuration.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::pipeline::orchestrator::Orchestrator;
use crate::kernel::ServerDeps;
use crate::server::routes::{
    cancel_session_handler, create_session_handler, health_handler, session_snapshot_handler,
    stream_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
    pub orchestrator: Arc<Orchestrator>,
    /// Pool handle for health reporting. None when the store is not
    /// Postgres-backed (in-memory setups).
    pub db_pool: Option<sqlx::PgPool>,
}

/// Build the axum application with all routes and middleware.
pub fn build_app(
    deps: Arc<ServerDeps>,
    orchestrator: Arc<Orchestrator>,
    db_pool: Option<sqlx::PgPool>,
) -> Router {
    // Multipart framing overhead on top of the image size cap.
    let body_limit = deps.config.upload.max_bytes + 64 * 1024;
    let state = AppState {
        deps,
        orchestrator,
        db_pool,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/sessions", post(create_session_handler))
        .route("/v1/sessions/:id", get(session_snapshot_handler))
        .route("/v1/sessions/:id", delete(cancel_session_handler))
        .route("/v1/sessions/:id/events", get(stream_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}
