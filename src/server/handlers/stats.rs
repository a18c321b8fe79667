//! Operational endpoints: crawler progress, check statistics, liveness.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use super::super::AppState;

/// GET /api/status/crawler
pub async fn get_crawler_status(State(state): State<AppState>) -> Response {
    match state.catalog.crawler_status(Utc::now()) {
        Ok(status) => Json(json!({
            "total": status.total,
            "pending_checks": status.pending_checks,
            "fresh_checks": status.fresh_checks,
            "checks_percentage": status.checks_percentage,
            "fresh_checks_percentage": status.fresh_checks_percentage,
        }))
        .into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Response {
    match state.checks.stats() {
        Ok((buckets, status_codes)) => Json(json!({
            "status": buckets
                .iter()
                .map(|b| json!({
                    "label": b.label,
                    "count": b.count,
                    "percentage": b.percentage,
                }))
                .collect::<Vec<_>>(),
            "status_codes": status_codes
                .iter()
                .map(|c| json!({
                    "code": c.code,
                    "count": c.count,
                    "percentage": c.percentage,
                }))
                .collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// GET /api/health for container orchestration.
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}
