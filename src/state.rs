use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AppConfig;
use crate::transport::HttpTransport;

/// Shared application state accessible to all relay handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    upstream_chat_url: String,
    backend_base_url: String,
    request_ids: RequestIdGenerator,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        let upstream_chat_url = format!(
            "{}{}",
            config.upstream.base_url.trim_end_matches('/'),
            config.upstream.chat_path
        );
        let backend_base_url = config.backend.base_url.trim_end_matches('/').to_string();
        Self {
            config,
            transport,
            upstream_chat_url,
            backend_base_url,
            request_ids: RequestIdGenerator::new(),
        }
    }

    /// Full upstream URL for streaming chat requests.
    #[must_use]
    pub fn upstream_chat_url(&self) -> &str {
        &self.upstream_chat_url
    }

    /// Backend base URL without a trailing slash.
    #[must_use]
    pub fn backend_base_url(&self) -> &str {
        &self.backend_base_url
    }

    pub fn next_request_seq(&self) -> u64 {
        self.request_ids.next_seq()
    }

    #[must_use]
    pub fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        self.request_ids.request_uuid(request_seq)
    }
}

/// Cheap per-process unique ids for log correlation.
pub(crate) struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub(crate) fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        uuid::Uuid::from_u128(self.seed ^ u128::from(request_seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_distinct() {
        let ids = RequestIdGenerator::new();
        let a = ids.next_seq();
        let b = ids.next_seq();
        assert_ne!(a, b);
        assert_ne!(ids.request_uuid(a), ids.request_uuid(b));
    }
}
