use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{backend_proxy, chat_relay, health};
use crate::error::RelayError;
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;
const BACKEND_PREFIX: &str = "/api/backend/";

#[derive(Debug, PartialEq, Eq)]
enum RouteMatch<'a> {
    Health,
    ChatRelay,
    Backend { rest: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching relay handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    let response = match route {
        RouteMatch::Health => health::health_handler(State(state)).into_response(),
        RouteMatch::ChatRelay => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            chat_relay::handler(State(state), parts.headers, body_bytes).await
        }
        RouteMatch::Backend { rest } => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            backend_proxy::handler(
                State(state),
                parts.method.clone(),
                rest,
                parts.uri.query(),
                parts.headers,
                body_bytes,
            )
            .await
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| RelayError::PayloadTooLarge.into_response())
}

fn match_route<'a>(method: &Method, path: &'a str, base_path: &str) -> RouteMatch<'a> {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    match path {
        "/" => {
            if method == Method::GET {
                RouteMatch::Health
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/api/ai-proxy/chat" => {
            if method == Method::POST {
                RouteMatch::ChatRelay
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        _ => match path.strip_prefix(BACKEND_PREFIX) {
            Some("") | None => RouteMatch::NotFound,
            Some(rest) => RouteMatch::Backend { rest },
        },
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_route() {
        assert_eq!(match_route(&Method::GET, "/", ""), RouteMatch::Health);
        assert_eq!(
            match_route(&Method::POST, "/api/ai-proxy/chat", ""),
            RouteMatch::ChatRelay
        );
        assert_eq!(
            match_route(&Method::GET, "/api/ai-proxy/chat", ""),
            RouteMatch::MethodNotAllowed
        );
        assert_eq!(
            match_route(&Method::DELETE, "/api/backend/sessions/4", ""),
            RouteMatch::Backend {
                rest: "sessions/4"
            }
        );
        assert_eq!(
            match_route(&Method::GET, "/api/backend/", ""),
            RouteMatch::NotFound
        );
        assert_eq!(match_route(&Method::GET, "/nope", ""), RouteMatch::NotFound);
    }

    #[test]
    fn test_base_path() {
        assert_eq!(normalize_base_path(" relay/ "), "/relay");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(
            match_route(&Method::POST, "/relay/api/ai-proxy/chat", "/relay"),
            RouteMatch::ChatRelay
        );
        assert_eq!(match_route(&Method::GET, "/relay", "/relay"), RouteMatch::Health);
        assert_eq!(
            match_route(&Method::GET, "/relayx/", "/relay"),
            RouteMatch::NotFound
        );
    }
}
