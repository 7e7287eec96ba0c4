use axum::body::Body;
use axum::response::Response;
use futures_util::TryStreamExt;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};

use crate::error::RelayError;

pub(crate) const EVENT_STREAM: &str = "text/event-stream";
const X_ACCEL_BUFFERING: http::HeaderName = http::HeaderName::from_static("x-accel-buffering");

/// Extract the caller's bearer token.
///
/// # Errors
///
/// Returns [`RelayError::Unauthorized`] when the header is missing, not a
/// bearer token, or empty.
pub(crate) fn require_bearer(headers: &HeaderMap) -> Result<&str, RelayError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(RelayError::Unauthorized)
}

/// Wrap a successful upstream event-stream response for the caller.
///
/// The body is piped chunk by chunk; nothing is buffered beyond what the
/// upstream has already sent.
pub(crate) fn build_event_stream_response(
    response: reqwest::Response,
    request_id: uuid::Uuid,
) -> Response {
    let status = response.status();
    let byte_stream = response.bytes_stream().inspect_err(move |err| {
        tracing::warn!(%request_id, error = %err, "upstream stream interrupted");
    });
    let body = Body::from_stream(byte_stream);

    let mut passthrough = Response::new(body);
    *passthrough.status_mut() = status;
    let headers = passthrough.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    passthrough
}

/// Sanitize an upstream error body for logging.
///
/// Attempts to extract a `message` field from JSON responses. Falls back to a
/// truncated UTF-8 representation capped at 500 chars.
pub(crate) fn sanitize_upstream_error(body: &[u8]) -> String {
    const MAX_LEN: usize = 500;

    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        let message = json
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| {
                json.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
            });
        if let Some(msg) = message {
            return truncate(msg, MAX_LEN);
        }
    }

    truncate(&String::from_utf8_lossy(body), MAX_LEN)
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_bearer() {
        let mut headers = HeaderMap::new();
        assert!(require_bearer(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(require_bearer(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  "));
        assert!(require_bearer(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer user-token"));
        assert_eq!(require_bearer(&headers).unwrap(), "user-token");
    }

    #[test]
    fn test_sanitize_dify_style_error() {
        let body = br#"{"code":"invalid_param","message":"query is required","status":400}"#;
        assert_eq!(sanitize_upstream_error(body), "query is required");
    }

    #[test]
    fn test_sanitize_nested_error() {
        let body = br#"{"error":{"message":"quota exceeded"}}"#;
        assert_eq!(sanitize_upstream_error(body), "quota exceeded");
    }

    #[test]
    fn test_sanitize_truncates_plain_text() {
        let body = "x".repeat(600);
        let out = sanitize_upstream_error(body.as_bytes());
        assert_eq!(out.len(), 503);
        assert!(out.ends_with("..."));
    }
}
