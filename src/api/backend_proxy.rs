use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde_json::json;

use crate::error::ErrorCategory;
use crate::state::AppState;

/// Headers copied from the caller to the backend.
const FORWARDED_REQUEST_HEADERS: [http::header::HeaderName; 3] = [AUTHORIZATION, CONTENT_TYPE, ACCEPT];

/// Transparent reverse proxy for session and message CRUD.
///
/// `path_suffix` is everything after `/api/backend/`; `query` is the raw query
/// string without `?`.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    path_suffix: &str,
    query: Option<&str>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(url) = is_safe_path(path_suffix)
        .then(|| build_backend_url(state.backend_base_url(), path_suffix, query))
        .flatten()
    else {
        tracing::warn!(%method, path = path_suffix, "backend path rejected");
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCategory::BadRequest,
            "The requested path is not allowed.",
        );
    };
    let mut forwarded = HeaderMap::with_capacity(FORWARDED_REQUEST_HEADERS.len());
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = headers.get(&name) {
            forwarded.insert(name, value.clone());
        }
    }

    let response = match state.transport.send(&url, method.clone(), forwarded, body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%method, path = path_suffix, error = %err, "backend request failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                ErrorCategory::UpstreamUnavailable,
                "The chat history service could not be reached. Please try again later.",
            );
        }
    };

    let status = response.status();
    tracing::debug!(%method, path = path_suffix, status = status.as_u16(), "backend request proxied");
    let content_type = response.headers().get(CONTENT_TYPE).cloned();

    let mut proxied = Response::new(Body::from_stream(response.bytes_stream()));
    *proxied.status_mut() = status;
    if let Some(content_type) = content_type {
        proxied.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    proxied
}

/// Join the suffix onto the backend base URL.
///
/// Returns `None` when the parsed target no longer sits under the base path,
/// e.g. after the URL parser resolves encoded dot segments.
fn build_backend_url(base_url: &str, path_suffix: &str, query: Option<&str>) -> Option<String> {
    let suffix = path_suffix.trim_start_matches('/');
    let mut joined = String::with_capacity(base_url.len() + suffix.len() + 2);
    joined.push_str(base_url);
    joined.push('/');
    joined.push_str(suffix);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        joined.push('?');
        joined.push_str(query);
    }

    let base = url::Url::parse(base_url).ok()?;
    let resolved = url::Url::parse(&joined).ok()?;
    let base_path = base.path().trim_end_matches('/');
    let contained = resolved.origin() == base.origin()
        && resolved
            .path()
            .strip_prefix(base_path)
            .is_some_and(|rest| rest.starts_with('/'));
    contained.then_some(joined)
}

fn is_safe_path(path_suffix: &str) -> bool {
    !path_suffix.is_empty()
        && !path_suffix.contains('\\')
        && !path_suffix.split('/').any(is_dot_segment)
}

/// `.` or `..`, including the percent-encoded spellings URL parsers honor.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn error_response(status: StatusCode, category: ErrorCategory, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": category.as_str(), "message": message })),
    )
        .into_response()
}
