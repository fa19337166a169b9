//! Route definitions for the gateway API.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{handlers, middleware, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.config.server.request_timeout;

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        .nest("/v1", api_routes())
        .nest("/admin", admin_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::cors_layer())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new().route("/completions", post(handlers::create_completion))
}

/// Admin/management routes
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/circuits", get(handlers::circuit_status))
        .route("/admission", get(handlers::admission_status))
}
