use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::ServerConfig;
use crate::error::RelayError;

const PARSED_URL_CACHE_MAX_ENTRIES: usize = 512;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    connect_timeout: Duration,
    use_env_proxy: bool,
) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout);

    if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Internal(format!("Failed to build HTTP client: {err}")))
}

/// Outbound HTTP client shared by the relay routes.
///
/// The reqwest client is built lazily on first use; parsed target URLs are
/// cached because the chat route hits the same upstream URL on every request.
pub struct HttpTransport {
    client: OnceLock<Arc<reqwest::Client>>,
    parsed_url_cache: RwLock<FxHashMap<String, Arc<url::Url>>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    connect_timeout: Duration,
    use_env_proxy: bool,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from the given server config.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };

        Self {
            client: OnceLock::new(),
            parsed_url_cache: RwLock::new(FxHashMap::default()),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            timeout: Duration::from_secs(config.timeout),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    fn reqwest_client(&self) -> Arc<reqwest::Client> {
        if let Some(existing) = self.client.get() {
            return existing.clone();
        }

        let built = match build_reqwest_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            self.timeout,
            self.connect_timeout,
            self.use_env_proxy,
        ) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                Arc::new(reqwest::Client::new())
            }
        };
        let _ = self.client.set(built.clone());
        self.client.get().cloned().unwrap_or(built)
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, RelayError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| RelayError::Internal(format!("Invalid target URL '{url}': {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PARSED_URL_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Send a request and return the response as soon as its head arrives.
    ///
    /// The body is left unread so callers can stream it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Internal`] for an unparseable URL and
    /// [`RelayError::Transport`] when the request cannot be completed.
    pub async fn send(
        &self,
        url: &str,
        method: http::Method,
        headers: http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, RelayError> {
        let parsed_url = self.parsed_url(url)?;
        let client = self.reqwest_client();

        let mut request = reqwest::Request::new(method, parsed_url.as_ref().clone());
        *request.headers_mut() = headers;
        if !body.is_empty() {
            *request.body_mut() = Some(reqwest::Body::from(body));
        }

        client.execute(request).await.map_err(|err| {
            let relay_err = RelayError::from_transport(&err);
            tracing::debug!(target_url = %url, error = %relay_err, "outbound request failed");
            relay_err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_lazy() {
        let transport = HttpTransport::new(&ServerConfig::default());
        assert!(transport.client.get().is_none());
        let first = transport.reqwest_client();
        let second = transport.reqwest_client();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_parsed_url_cache_hit() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let first = transport.parsed_url("http://127.0.0.1:9000/v1").unwrap();
        let second = transport.parsed_url("http://127.0.0.1:9000/v1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_parsed_url_invalid() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let err = transport.parsed_url("not a url").unwrap_err();
        assert!(matches!(err, RelayError::Internal(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_classified() {
        // Bind then drop a listener so the port is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(&ServerConfig::default());
        let err = transport
            .send(
                &format!("http://{addr}/v1/chat-messages"),
                http::Method::POST,
                http::HeaderMap::new(),
                bytes::Bytes::from_static(b"{}"),
            )
            .await
            .unwrap_err();
        match err {
            RelayError::Transport { failure, .. } => {
                assert_eq!(failure, crate::error::TransportFailure::ConnectionRefused);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
