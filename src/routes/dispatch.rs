//! Catch-all route handing every request to the container.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

/// Route is the request path, method the HTTP method, payload the body. GET
/// and DELETE requests without a body read their query string as the payload.
async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let container = state.container()?;
    let payload = if body.is_empty() {
        query_payload(uri.query())?
    } else {
        body.to_vec()
    };
    tracing::debug!(route = %uri.path(), method = %method, "dispatch");
    let out = container.dispatch(uri.path(), method.as_str(), &payload).await?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], out))
}

fn query_payload(query: Option<&str>) -> Result<Vec<u8>, AppError> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return Ok(Vec::new());
    };
    let mut map = serde_json::Map::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(k.to_string(), serde_json::Value::String(v.replace('+', " ")));
    }
    Ok(serde_json::to_vec(&serde_json::Value::Object(map))?)
}

/// Fallback router sending every unmatched request to the container, with the
/// configured request body limit.
pub fn dispatch_routes(state: AppState) -> Router {
    let limit = state.runtime.max_body_bytes;
    Router::new()
        .fallback(dispatch)
        .layer(RequestBodyLimitLayer::new(limit))
        .with_state(state)
}

/// Health, readiness, version, setting endpoints and the dispatch fallback.
pub fn app(state: AppState) -> Router {
    super::common_routes_with_ready(state.clone())
        .merge(super::setting_routes(state.clone()))
        .merge(dispatch_routes(state))
}
