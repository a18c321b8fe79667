//! Resource-exception endpoints: size-cap overrides owned by operators.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use super::super::{auth, AppState};
use crate::schemas::ResourceExceptionSchema;

/// GET /api/resources-exceptions/
pub async fn list_exceptions(State(state): State<AppState>) -> Response {
    match state.exceptions.get_all() {
        Ok(exceptions) => {
            let body: Vec<_> = exceptions
                .iter()
                .map(|e| {
                    json!({
                        "resource_id": e.resource_id,
                        "table_indexes": e.table_indexes,
                        "comment": e.comment,
                    })
                })
                .collect();
            Json(body).into_response()
        }
        Err(e) => super::storage_error(&e),
    }
}

/// POST /api/resources-exceptions/
pub async fn create_exception(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(status) = auth::require_token(&state.settings, &headers) {
        return status.into_response();
    }

    let payload: ResourceExceptionSchema = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let table_indexes = payload.table_indexes.unwrap_or_default();
    if let Err(message) = ResourceExceptionSchema::validate_table_indexes(
        &table_indexes,
        &state.settings.analysis.sql_indexes_types_supported,
    ) {
        return (StatusCode::BAD_REQUEST, message).into_response();
    }

    // the exception must point at a known resource
    match state.catalog.get(payload.resource_id) {
        Ok(Some(_)) => {}
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return super::storage_error(&e),
    }

    match state
        .exceptions
        .insert(payload.resource_id, &table_indexes, payload.comment.as_deref())
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({"resource_id": payload.resource_id})),
        )
            .into_response(),
        Err(e) => super::storage_error(&e),
    }
}

/// DELETE /api/resources-exceptions/{id}
pub async fn delete_exception(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(resource_id): Path<Uuid>,
) -> Response {
    if let Err(status) = auth::require_token(&state.settings, &headers) {
        return status.into_response();
    }
    match state.exceptions.delete(resource_id) {
        Ok(true) => Json(json!({"resource_id": resource_id})).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => super::storage_error(&e),
    }
}
