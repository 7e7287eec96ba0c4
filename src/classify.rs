//! Error classification for chat failures.
//!
//! Structured errors are classified by matching on their status, relay code
//! and transport kind. Text matching is only used when the failure carries
//! nothing but an unstructured message.

use crate::error::{category_from_status, ChatError, ErrorCategory, TransportFailure};

/// Classify a client-side chat failure.
#[must_use]
pub fn classify(err: &ChatError) -> ErrorCategory {
    match err {
        ChatError::Status { status, code, body } => {
            if let Some(category) = code.as_deref().and_then(|c| c.parse().ok()) {
                return category;
            }
            match category_from_status(*status) {
                // 400 bodies are where providers report moderation rejections.
                ErrorCategory::BadRequest if is_content_filter_text(body) => {
                    ErrorCategory::ContentFiltered
                }
                ErrorCategory::Unknown => classify_message(body),
                category => category,
            }
        }
        ChatError::Network { failure, .. } => match failure {
            TransportFailure::Timeout => ErrorCategory::Timeout,
            TransportFailure::ConnectionRefused
            | TransportFailure::Dns
            | TransportFailure::Aborted
            | TransportFailure::Other => ErrorCategory::NetworkUnreachable,
        },
        ChatError::Interrupted(_) => ErrorCategory::NetworkUnreachable,
        ChatError::InvalidRequest(_) => ErrorCategory::BadRequest,
        ChatError::Cancelled => ErrorCategory::Unknown,
    }
}

struct Rule {
    category: ErrorCategory,
    needles: &'static [&'static str],
}

/// Checked top to bottom; more specific categories come first.
const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::AuthExpired,
        needles: &["401", "unauthorized", "token expired", "session expired", "auth_expired"],
    },
    Rule {
        category: ErrorCategory::RateLimited,
        needles: &["429", "rate limit", "rate_limit", "too many requests", "quota"],
    },
    Rule {
        category: ErrorCategory::ContentFiltered,
        needles: &["content_filter", "content filter", "sensitive", "moderation", "blocked"],
    },
    Rule {
        category: ErrorCategory::Forbidden,
        needles: &["403", "forbidden", "permission"],
    },
    Rule {
        category: ErrorCategory::NotFound,
        needles: &["404", "not found"],
    },
    Rule {
        category: ErrorCategory::Timeout,
        needles: &["408", "504", "timeout", "timed out"],
    },
    Rule {
        category: ErrorCategory::UpstreamUnavailable,
        needles: &["500", "502", "503", "unavailable", "bad gateway", "overloaded"],
    },
    Rule {
        category: ErrorCategory::BadRequest,
        needles: &["400", "413", "bad request", "invalid", "too long", "too large"],
    },
    Rule {
        category: ErrorCategory::NetworkUnreachable,
        needles: &[
            "network",
            "failed to fetch",
            "connection refused",
            "unreachable",
            "dns",
        ],
    },
];

/// Classify a raw error message by substring matching.
#[must_use]
pub fn classify_message(message: &str) -> ErrorCategory {
    let lowered = message.to_ascii_lowercase();
    RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|needle| lowered.contains(needle)))
        .map_or(ErrorCategory::Unknown, |rule| rule.category)
}

fn is_content_filter_text(body: &str) -> bool {
    classify_message(body) == ErrorCategory::ContentFiltered
}

impl ErrorCategory {
    /// Localized text shown in place of the answer.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCategory::AuthExpired => "Your session has expired. Please sign in again.",
            ErrorCategory::RateLimited => {
                "You are sending messages too quickly. Please wait a moment and try again."
            }
            ErrorCategory::ContentFiltered => {
                "This question can't be answered. Please rephrase it and try again."
            }
            ErrorCategory::UpstreamUnavailable => {
                "The admissions assistant is temporarily unavailable. Please try again later."
            }
            ErrorCategory::BadRequest => {
                "Your message could not be processed. Please shorten or rephrase it."
            }
            ErrorCategory::Forbidden => "You do not have permission to use the assistant.",
            ErrorCategory::NotFound => "The assistant service could not be found.",
            ErrorCategory::Timeout => "The assistant took too long to respond. Please try again.",
            ErrorCategory::NetworkUnreachable => {
                "Network connection failed. Please check your connection and try again."
            }
            ErrorCategory::Unknown => "Something went wrong. Please try again.",
        }
    }

    /// Label for the retry affordance next to the error.
    #[must_use]
    pub fn retry_label(self) -> &'static str {
        match self {
            ErrorCategory::AuthExpired => "Sign in again",
            ErrorCategory::RateLimited => "Retry in a moment",
            ErrorCategory::ContentFiltered | ErrorCategory::BadRequest => "Edit and resend",
            ErrorCategory::Forbidden | ErrorCategory::NotFound => "Contact support",
            ErrorCategory::UpstreamUnavailable
            | ErrorCategory::Timeout
            | ErrorCategory::NetworkUnreachable
            | ErrorCategory::Unknown => "Retry",
        }
    }

    /// Whether resending the same message can succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimited
                | ErrorCategory::UpstreamUnavailable
                | ErrorCategory::Timeout
                | ErrorCategory::NetworkUnreachable
                | ErrorCategory::Unknown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_errors() {
        let err = ChatError::from_status(429, "slow down".to_string());
        assert_eq!(classify(&err), ErrorCategory::RateLimited);

        let err = ChatError::from_status(401, String::new());
        assert_eq!(classify(&err), ErrorCategory::AuthExpired);

        let err = ChatError::from_status(503, "{}".to_string());
        assert_eq!(classify(&err), ErrorCategory::UpstreamUnavailable);
    }

    #[test]
    fn test_relay_code_wins_over_status() {
        let err = ChatError::from_status(
            500,
            r#"{"error":"timeout","message":"took too long"}"#.to_string(),
        );
        assert_eq!(classify(&err), ErrorCategory::Timeout);
    }

    #[test]
    fn test_bad_request_with_moderation_body() {
        let err = ChatError::from_status(
            400,
            r#"{"code":"content_filter","message":"sensitive words"}"#.to_string(),
        );
        assert_eq!(classify(&err), ErrorCategory::ContentFiltered);
    }

    #[test]
    fn test_unknown_status_falls_back_to_text() {
        let err = ChatError::from_status(418, "request timed out upstream".to_string());
        assert_eq!(classify(&err), ErrorCategory::Timeout);
    }

    #[test]
    fn test_network_errors() {
        let err = ChatError::Network {
            failure: TransportFailure::Timeout,
            message: "operation timed out".to_string(),
        };
        assert_eq!(classify(&err), ErrorCategory::Timeout);

        let err = ChatError::Network {
            failure: TransportFailure::ConnectionRefused,
            message: "connection refused".to_string(),
        };
        assert_eq!(classify(&err), ErrorCategory::NetworkUnreachable);

        let err = ChatError::Interrupted("body closed".to_string());
        assert_eq!(classify(&err), ErrorCategory::NetworkUnreachable);
    }

    #[test]
    fn test_message_priority_order() {
        // Auth is checked before the generic "invalid" bad-request keyword.
        assert_eq!(
            classify_message("401 invalid token"),
            ErrorCategory::AuthExpired
        );
        assert_eq!(
            classify_message("HTTP 429: Too Many Requests"),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            classify_message("gateway 504 timeout"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_message("HTTP 502 Bad Gateway"),
            ErrorCategory::UpstreamUnavailable
        );
        assert_eq!(
            classify_message("TypeError: Failed to fetch"),
            ErrorCategory::NetworkUnreachable
        );
        assert_eq!(classify_message("weird"), ErrorCategory::Unknown);
        assert_eq!(classify_message(""), ErrorCategory::Unknown);
    }

    #[test]
    fn test_every_category_has_text() {
        for category in ErrorCategory::ALL {
            assert!(!category.user_message().is_empty());
            assert!(!category.retry_label().is_empty());
        }
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(!ErrorCategory::AuthExpired.is_retryable());
    }
}
