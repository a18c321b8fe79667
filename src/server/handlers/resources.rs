//! Resource endpoints: catalog lookups and upstream create/update/delete
//! events.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use super::super::{auth, AppState};
use crate::models::{Resource, ResourceStatus};
use crate::schemas::ResourceSchema;
use crate::utils::is_valid_uri;

fn resource_json(resource: &Resource) -> serde_json::Value {
    json!({
        "dataset_id": resource.dataset_id,
        "resource_id": resource.resource_id,
        "url": resource.url,
        "domain": resource.domain,
        "deleted": resource.deleted,
        "priority": resource.priority,
        "initialization": resource.initialization,
        "status": resource.status.map(|s| s.as_str()),
        "last_check": resource.last_check,
        "next_check_at": resource.next_check_at.map(|d| d.to_rfc3339()),
        "harvest_modified_at": resource.harvest_modified_at.map(|d| d.to_rfc3339()),
    })
}

/// GET /api/resources/{id}
pub async fn get_resource(
    State(state): State<AppState>,
    Path(resource_id): Path<Uuid>,
) -> Response {
    match state.catalog.get(resource_id) {
        Ok(Some(resource)) => Json(resource_json(&resource)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// GET /api/resources/{id}/status/
pub async fn get_resource_status(
    State(state): State<AppState>,
    Path(resource_id): Path<Uuid>,
) -> Response {
    let resource = match state.catalog.get(resource_id) {
        Ok(Some(resource)) => resource,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return super::storage_error(&e),
    };

    let latest_check_url = format!(
        "{}/api/checks/latest?resource_id={}",
        state.settings.api_base_url.trim_end_matches('/'),
        resource.resource_id
    );
    debug_assert!(is_valid_uri(&latest_check_url));

    Json(json!({
        "resource_id": resource.resource_id,
        "status": resource.status.map(|s| s.as_str()),
        "status_verbose": ResourceStatus::verbose_opt(resource.status),
        "latest_check_url": latest_check_url,
    }))
    .into_response()
}

fn parse_resource_event(body: &Bytes) -> Result<(ResourceSchema, String), Response> {
    let payload: ResourceSchema = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => return Err((StatusCode::BAD_REQUEST, e.to_string()).into_response()),
    };
    let Some(document) = payload.document.clone() else {
        return Err((StatusCode::BAD_REQUEST, "Missing document body").into_response());
    };
    Ok((payload, document.url.clone()))
}

/// POST /api/resources/ receives an upstream create event.
pub async fn create_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(status) = auth::require_token(&state.settings, &headers) {
        return status.into_response();
    }
    let (payload, url) = match parse_resource_event(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let harvest_modified_at = payload
        .document
        .as_ref()
        .and_then(|d| d.harvest_modified_at());

    match state.catalog.upsert_resource(
        &payload.dataset_id,
        payload.resource_id,
        &url,
        harvest_modified_at,
    ) {
        Ok(_) => Json(json!({"id": payload.resource_id})).into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// PUT /api/resources/{id} receives an upstream update event; the URL may change,
/// the row is mutated in place.
pub async fn update_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(_resource_id): Path<Uuid>,
    body: Bytes,
) -> Response {
    if let Err(status) = auth::require_token(&state.settings, &headers) {
        return status.into_response();
    }
    let (payload, url) = match parse_resource_event(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let harvest_modified_at = payload
        .document
        .as_ref()
        .and_then(|d| d.harvest_modified_at());

    match state.catalog.upsert_resource(
        &payload.dataset_id,
        payload.resource_id,
        &url,
        harvest_modified_at,
    ) {
        Ok(_) => Json(json!({"id": payload.resource_id})).into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// DELETE /api/resources/{id} performs the soft delete.
pub async fn delete_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(resource_id): Path<Uuid>,
) -> Response {
    if let Err(status) = auth::require_token(&state.settings, &headers) {
        return status.into_response();
    }
    match state.catalog.soft_delete(resource_id) {
        Ok(true) => Json(json!({"id": resource_id})).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => super::storage_error(&e),
    }
}
