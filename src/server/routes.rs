//! Router configuration for the web server.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Probe log
        .route("/api/checks/latest/", get(handlers::get_latest_check))
        .route("/api/checks/all/", get(handlers::get_all_checks))
        .route("/api/checks/", post(handlers::create_check))
        // Catalog
        .route("/api/resources/", post(handlers::create_resource))
        .route(
            "/api/resources/:resource_id",
            get(handlers::get_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .route(
            "/api/resources/:resource_id/status/",
            get(handlers::get_resource_status),
        )
        // Size-cap overrides
        .route(
            "/api/resources-exceptions/",
            get(handlers::list_exceptions).post(handlers::create_exception),
        )
        .route(
            "/api/resources-exceptions/:resource_id",
            axum::routing::delete(handlers::delete_exception),
        )
        // Operations
        .route("/api/status/crawler", get(handlers::get_crawler_status))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
