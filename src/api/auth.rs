//! Pre-shared key check.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use super::error::ApiError;
use crate::client::API_KEY_HEADER;
use crate::config::secrets::key_matches;

/// Reject requests without the configured key in `x-api-key`.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| key_matches(&state.api_key, key));
    if !authorized {
        debug!(path = %request.uri().path(), "rejected request without valid api key");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

#[derive(Deserialize)]
struct KeyParam {
    key: Option<String>,
}

/// Like [`require_api_key`], but also accepts `?key=`. Only for the event
/// stream, since `EventSource` cannot set headers.
pub async fn require_api_key_or_query(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let from_header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| key_matches(&state.api_key, key));
    let from_query = Query::<KeyParam>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(p)| p.key)
        .is_some_and(|key| key_matches(&state.api_key, &key));
    if !(from_header || from_query) {
        debug!(path = %request.uri().path(), "rejected event stream without valid api key");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}
