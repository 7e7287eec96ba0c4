use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};

use super::common::{
    build_event_stream_response, require_bearer, sanitize_upstream_error, EVENT_STREAM,
};
use crate::error::RelayError;
use crate::state::AppState;

/// Relay a streaming chat request to the upstream AI provider.
///
/// The caller's body is forwarded unmodified. The caller's bearer token only
/// gates access; the provider credential is injected here and never leaves
/// the server.
pub async fn handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let request_seq = state.next_request_seq();
    let request_id = state.request_uuid(request_seq);
    let start = Instant::now();

    match relay_chat(&state, &headers, body, request_id).await {
        Ok(response) => {
            tracing::info!(
                %request_id,
                first_byte_ms = start.elapsed().as_millis(),
                "chat stream opened"
            );
            response
        }
        Err(err) => {
            let status = err.status().as_u16();
            if status >= 500 {
                tracing::error!(%request_id, status, error = %err, "chat relay failed");
            } else {
                tracing::warn!(%request_id, status, error = %err, "chat relay rejected");
            }
            err.into_response()
        }
    }
}

async fn relay_chat(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
    request_id: uuid::Uuid,
) -> Result<Response, RelayError> {
    require_bearer(headers)?;
    validate_chat_body(&body)?;

    let upstream_headers = build_upstream_headers(&state.config.upstream.api_key)?;
    let response = state
        .transport
        .send(state.upstream_chat_url(), Method::POST, upstream_headers, body)
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_body = match response.bytes().await {
            Ok(bytes) => sanitize_upstream_error(&bytes),
            Err(err) => format!("<unreadable error body: {err}>"),
        };
        tracing::warn!(
            %request_id,
            status = status.as_u16(),
            upstream_error = %error_body,
            "upstream rejected chat request"
        );
        return Err(RelayError::Upstream {
            status: status.as_u16(),
            body: error_body,
        });
    }

    Ok(build_event_stream_response(response, request_id))
}

/// The body is passed through as-is, but it must at least be a JSON object.
fn validate_chat_body(body: &[u8]) -> Result<(), RelayError> {
    if body.is_empty() {
        return Err(RelayError::InvalidRequest("empty request body".to_string()));
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        Ok(_) => Err(RelayError::InvalidRequest(
            "request body must be a JSON object".to_string(),
        )),
        Err(err) => Err(RelayError::InvalidRequest(format!("malformed JSON: {err}"))),
    }
}

fn build_upstream_headers(api_key: &str) -> Result<HeaderMap, RelayError> {
    let mut headers = HeaderMap::with_capacity(3);
    let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|_| RelayError::Internal("upstream api_key is not a valid header value".into()))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_chat_body() {
        assert!(validate_chat_body(br#"{"query":"hi"}"#).is_ok());
        assert!(matches!(
            validate_chat_body(b""),
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(validate_chat_body(b"[1,2]").is_err());
        assert!(validate_chat_body(b"{oops").is_err());
    }

    #[test]
    fn test_upstream_headers_carry_provider_key() {
        let headers = build_upstream_headers("app-secret").unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer app-secret");
        assert!(headers[AUTHORIZATION].is_sensitive());
        assert_eq!(headers[ACCEPT], EVENT_STREAM);
    }
}
