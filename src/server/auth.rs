//! Bearer-token auth for mutating endpoints.

use axum::http::{header, HeaderMap, StatusCode};

use crate::config::Settings;

/// Verify the Authorization header: missing token is 401, a present but
/// wrong or malformed one is 403.
pub fn require_token(settings: &Settings, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let presented = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if !settings.api_token.is_empty() && token == settings.api_token => Ok(()),
        _ => Err(StatusCode::FORBIDDEN),
    }
}
