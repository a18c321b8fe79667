//! Check endpoints: latest, history, on-demand probe.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::super::{auth, AppState};
use crate::models::Resource;
use crate::schemas::CheckCreateSchema;

/// Accepted query parameters for check lookups. Anything else is a 400.
fn resource_from_query(
    state: &AppState,
    params: &std::collections::HashMap<String, String>,
) -> Result<Option<Resource>, Response> {
    if params.is_empty() || params.keys().any(|k| k != "url" && k != "resource_id") {
        return Err((StatusCode::BAD_REQUEST, "Invalid query parameters").into_response());
    }
    if let Some(raw) = params.get("resource_id") {
        let Ok(resource_id) = raw.parse::<uuid::Uuid>() else {
            return Err((StatusCode::BAD_REQUEST, "Invalid resource_id").into_response());
        };
        return state
            .catalog
            .get(resource_id)
            .map_err(|e| super::storage_error(&e));
    }
    if let Some(url) = params.get("url") {
        return state
            .catalog
            .get_by_url(url)
            .map_err(|e| super::storage_error(&e));
    }
    Err((StatusCode::BAD_REQUEST, "Invalid query parameters").into_response())
}

/// GET /api/checks/latest/?url=…|resource_id=…
pub async fn get_latest_check(
    State(state): State<AppState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    let resource = match resource_from_query(&state, &params) {
        Ok(Some(resource)) => resource,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(response) => return response,
    };
    if resource.deleted {
        return StatusCode::GONE.into_response();
    }
    match state.checks.latest_for_resource(resource.resource_id) {
        Ok(Some(check)) => Json(check.to_api_json(resource.deleted)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// GET /api/checks/all/ for a resource, newest first.
pub async fn get_all_checks(
    State(state): State<AppState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    let resource = match resource_from_query(&state, &params) {
        Ok(Some(resource)) => resource,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(response) => return response,
    };
    match state.checks.all_for_resource(resource.resource_id) {
        Ok(checks) if checks.is_empty() => StatusCode::NOT_FOUND.into_response(),
        Ok(checks) => {
            let body: Vec<_> = checks
                .iter()
                .map(|c| c.to_api_json(resource.deleted))
                .collect();
            Json(body).into_response()
        }
        Err(e) => super::storage_error(&e),
    }
}

/// POST /api/checks/ forces a one-off probe, bypassing the scheduler.
pub async fn create_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(status) = auth::require_token(&state.settings, &headers) {
        return status.into_response();
    }

    let payload: CheckCreateSchema = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let resource = match state.catalog.get(payload.resource_id) {
        Ok(Some(resource)) => resource,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return super::storage_error(&e),
    };
    if resource.deleted {
        return StatusCode::GONE.into_response();
    }

    // refuse a second in-flight probe for the same resource
    match state.catalog.claim_for_probe(resource.resource_id) {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": "resource is already being processed"})),
            )
                .into_response()
        }
        Err(e) => return super::storage_error(&e),
    }

    match state
        .crawler
        .probe_resource(&resource, payload.force_analysis)
        .await
    {
        Ok(check) => (
            StatusCode::CREATED,
            Json(check.to_api_json(resource.deleted)),
        )
            .into_response(),
        Err(e) => super::storage_error(&e),
    }
}
