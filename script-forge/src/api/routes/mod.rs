//! API route modules.

pub mod health;
pub mod logging;
pub mod pipeline;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/pipeline", pipeline::router())
        .nest("/api/logging", logging::config_router())
        .nest("/api/logs", logging::stream_router())
        .nest("/health", health::router())
        .with_state(state)
}
