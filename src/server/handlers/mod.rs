//! HTTP request handlers.
//!
//! Validation failures map to 400 with the validator's message, auth
//! failures to 401/403, missing entities to 404, deleted entities to 410
//! and storage errors to a generic 500 body.

mod checks;
mod exceptions;
mod resources;
mod stats;

pub use checks::{create_check, get_all_checks, get_latest_check};
pub use exceptions::{create_exception, delete_exception, list_exceptions};
pub use resources::{
    create_resource, delete_resource, get_resource, get_resource_status, update_resource,
};
pub use stats::{get_crawler_status, get_stats, health};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::repository::RepositoryError;

/// Unexpected storage failure: log the detail, serve a generic body.
pub(crate) fn storage_error(e: &RepositoryError) -> Response {
    error!("Storage error while handling request: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}
