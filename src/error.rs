use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User-facing error category, independent of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthExpired,
    RateLimited,
    ContentFiltered,
    UpstreamUnavailable,
    BadRequest,
    Forbidden,
    NotFound,
    Timeout,
    NetworkUnreachable,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::AuthExpired,
        ErrorCategory::RateLimited,
        ErrorCategory::ContentFiltered,
        ErrorCategory::UpstreamUnavailable,
        ErrorCategory::BadRequest,
        ErrorCategory::Forbidden,
        ErrorCategory::NotFound,
        ErrorCategory::Timeout,
        ErrorCategory::NetworkUnreachable,
        ErrorCategory::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::AuthExpired => "auth_expired",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::ContentFiltered => "content_filtered",
            ErrorCategory::UpstreamUnavailable => "upstream_unavailable",
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::NetworkUnreachable => "network_unreachable",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or(())
    }
}

/// Map an HTTP status code to an error category.
#[must_use]
pub fn category_from_status(status: u16) -> ErrorCategory {
    match status {
        400 | 413 | 422 => ErrorCategory::BadRequest,
        401 => ErrorCategory::AuthExpired,
        403 => ErrorCategory::Forbidden,
        404 => ErrorCategory::NotFound,
        408 | 504 => ErrorCategory::Timeout,
        429 => ErrorCategory::RateLimited,
        500..=599 => ErrorCategory::UpstreamUnavailable,
        _ => ErrorCategory::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Transport failures
// ---------------------------------------------------------------------------

/// Network-level failure kind for an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    ConnectionRefused,
    Dns,
    Timeout,
    Aborted,
    Other,
}

impl TransportFailure {
    /// Classify a `reqwest` error by its kind and source chain.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportFailure::Timeout;
        }
        let chain = error_chain_message(err).to_ascii_lowercase();
        if chain.contains("dns error")
            || chain.contains("failed to lookup")
            || chain.contains("name or service not known")
            || chain.contains("no such host")
        {
            return TransportFailure::Dns;
        }
        if chain.contains("connection refused") {
            return TransportFailure::ConnectionRefused;
        }
        if chain.contains("timed out") {
            return TransportFailure::Timeout;
        }
        if chain.contains("aborted")
            || chain.contains("connection reset")
            || chain.contains("connection closed")
            || chain.contains("broken pipe")
        {
            return TransportFailure::Aborted;
        }
        TransportFailure::Other
    }

    /// HTTP status the relay answers with for this failure.
    #[must_use]
    pub fn relay_status(self) -> http::StatusCode {
        match self {
            TransportFailure::ConnectionRefused => http::StatusCode::SERVICE_UNAVAILABLE,
            TransportFailure::Dns => http::StatusCode::GATEWAY_TIMEOUT,
            TransportFailure::Timeout => http::StatusCode::INTERNAL_SERVER_ERROR,
            TransportFailure::Aborted => http::StatusCode::REQUEST_TIMEOUT,
            TransportFailure::Other => http::StatusCode::BAD_GATEWAY,
        }
    }

    #[must_use]
    pub fn category(self) -> ErrorCategory {
        match self {
            TransportFailure::ConnectionRefused | TransportFailure::Other => {
                ErrorCategory::UpstreamUnavailable
            }
            TransportFailure::Dns => ErrorCategory::NetworkUnreachable,
            TransportFailure::Timeout | TransportFailure::Aborted => ErrorCategory::Timeout,
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportFailure::ConnectionRefused => "connection_refused",
            TransportFailure::Dns => "dns",
            TransportFailure::Timeout => "timeout",
            TransportFailure::Aborted => "aborted",
            TransportFailure::Other => "other",
        };
        f.write_str(name)
    }
}

/// Join an error and all of its sources into one line.
#[must_use]
pub fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

// ---------------------------------------------------------------------------
// Relay errors
// ---------------------------------------------------------------------------

/// Error type for the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Missing or malformed authorization header")]
    Unauthorized,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Upstream error: status={status}, body={body}")]
    Upstream { status: u16, body: String },
    #[error("Transport error ({failure}): {message}")]
    Transport {
        failure: TransportFailure,
        message: String,
    },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        RelayError::Transport {
            failure: TransportFailure::from_reqwest(err),
            message: error_chain_message(err),
        }
    }

    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        match self {
            RelayError::Unauthorized => http::StatusCode::UNAUTHORIZED,
            RelayError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge => http::StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::Upstream { status, .. } => {
                http::StatusCode::from_u16(*status).unwrap_or(http::StatusCode::BAD_GATEWAY)
            }
            RelayError::Transport { failure, .. } => failure.relay_status(),
            RelayError::Internal(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::Unauthorized => ErrorCategory::AuthExpired,
            RelayError::InvalidRequest(_) | RelayError::PayloadTooLarge => {
                ErrorCategory::BadRequest
            }
            RelayError::Upstream { status, .. } => category_from_status(*status),
            RelayError::Transport { failure, .. } => failure.category(),
            RelayError::Internal(_) => ErrorCategory::Unknown,
        }
    }

    /// Localized message returned to the caller. Never includes upstream
    /// bodies or credentials.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            RelayError::Unauthorized => "Your session has expired. Please sign in again.",
            RelayError::InvalidRequest(_) => "The request was invalid. Please check your input.",
            RelayError::PayloadTooLarge => "Your message is too long. Please shorten it.",
            RelayError::Upstream { status, .. } => upstream_status_message(*status),
            RelayError::Transport { failure, .. } => transport_failure_message(*failure),
            RelayError::Internal(_) => "Something went wrong. Please try again later.",
        }
    }

    /// The `{error, message}` body sent back to the caller.
    #[must_use]
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.category().as_str(),
            "message": self.public_message(),
        })
    }
}

/// Fixed message table keyed by upstream status class.
#[must_use]
pub fn upstream_status_message(status: u16) -> &'static str {
    match status {
        400 => "The request was invalid. Please check your input.",
        401 => "Your session has expired. Please sign in again.",
        403 => "You do not have permission to use the assistant.",
        404 => "The assistant service could not be found.",
        429 => "Too many requests. Please wait a moment and try again.",
        500..=599 => "The assistant is temporarily unavailable. Please try again later.",
        _ => "The assistant could not answer right now. Please try again.",
    }
}

fn transport_failure_message(failure: TransportFailure) -> &'static str {
    match failure {
        TransportFailure::ConnectionRefused => {
            "The assistant service refused the connection. Please try again later."
        }
        TransportFailure::Dns => "The assistant service address could not be resolved.",
        TransportFailure::Timeout => "The assistant took too long to respond. Please try again.",
        TransportFailure::Aborted => "The request to the assistant was aborted. Please try again.",
        TransportFailure::Other => "The assistant service could not be reached.",
    }
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), axum::Json(self.to_body())).into_response()
    }
}

// ---------------------------------------------------------------------------
// Client errors
// ---------------------------------------------------------------------------

/// Failure of one streamed chat request on the client side.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The initial response was not successful.
    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        code: Option<String>,
        body: String,
    },
    /// The request could not be sent or no response head arrived.
    #[error("Network error ({failure}): {message}")]
    Network {
        failure: TransportFailure,
        message: String,
    },
    /// The body stream failed after the response started.
    #[error("Stream interrupted: {0}")]
    Interrupted(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        ChatError::Network {
            failure: TransportFailure::from_reqwest(err),
            message: error_chain_message(err),
        }
    }

    /// Build a status error from a non-success body, picking up the relay's
    /// `error` code when present.
    #[must_use]
    pub fn from_status(status: u16, body: String) -> Self {
        let code = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|json| {
                json.get("error")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned)
            });
        ChatError::Status { status, code, body }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_category_round_trip_names() {
        for category in ErrorCategory::ALL {
            assert_eq!(category.as_str().parse::<ErrorCategory>(), Ok(category));
        }
        assert!("nope".parse::<ErrorCategory>().is_err());
    }

    #[test]
    fn test_category_from_status() {
        assert_eq!(category_from_status(429), ErrorCategory::RateLimited);
        assert_eq!(category_from_status(401), ErrorCategory::AuthExpired);
        assert_eq!(category_from_status(504), ErrorCategory::Timeout);
        assert_eq!(category_from_status(502), ErrorCategory::UpstreamUnavailable);
        assert_eq!(category_from_status(418), ErrorCategory::Unknown);
    }

    #[test]
    fn test_transport_failure_statuses() {
        assert_eq!(TransportFailure::ConnectionRefused.relay_status().as_u16(), 503);
        assert_eq!(TransportFailure::Dns.relay_status().as_u16(), 504);
        assert_eq!(TransportFailure::Timeout.relay_status().as_u16(), 500);
        assert_eq!(TransportFailure::Aborted.relay_status().as_u16(), 408);
    }

    #[test]
    fn test_upstream_error_mirrors_status() {
        let err = RelayError::Upstream {
            status: 429,
            body: "{\"code\":\"too_many\"}".to_string(),
        };
        assert_eq!(err.status().as_u16(), 429);
        let body = err.to_body();
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["message"], upstream_status_message(429));
        assert!(!body["message"].as_str().unwrap().contains("too_many"));

        let response = err.into_response();
        assert_eq!(response.status().as_u16(), 429);
    }

    #[test]
    fn test_status_message_table() {
        assert!(upstream_status_message(503).contains("temporarily unavailable"));
        assert!(upstream_status_message(401).contains("expired"));
        assert_eq!(upstream_status_message(302), upstream_status_message(418));
    }

    #[test]
    fn test_chat_error_picks_up_relay_code() {
        let err = ChatError::from_status(
            429,
            r#"{"error":"rate_limited","message":"Too many requests."}"#.to_string(),
        );
        match &err {
            ChatError::Status { status, code, .. } => {
                assert_eq!(*status, 429);
                assert_eq!(code.as_deref(), Some("rate_limited"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("HTTP 429: "));

        let err = ChatError::from_status(500, "plain text".to_string());
        assert!(matches!(err, ChatError::Status { code: None, .. }));
    }
}
