pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::{validate_client_config, validate_config};

/// Environment variable that overrides `upstream.api_key`.
pub const UPSTREAM_API_KEY_ENV: &str = "CHAT_RELAY_UPSTREAM_API_KEY";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upstream request timeout in seconds. Covers the whole streamed answer.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub http_use_env_proxy: bool,
}

fn default_port() -> u16 {
    3001
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            base_path: String::new(),
            http_use_env_proxy: false,
        }
    }
}

/// Upstream AI provider the chat route forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Provider credential. Injected by the relay, never sent to callers.
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
}

fn default_chat_path() -> String {
    "/v1/chat-messages".to_string()
}

/// Backend API for session and message storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
}

/// Settings for the chat client library and CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the relay, e.g. `http://127.0.0.1:3001`.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    #[serde(default = "default_client_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_relay_url() -> String {
    "http://127.0.0.1:3001".to_string()
}
fn default_page_size() -> usize {
    5
}
fn default_credentials_path() -> String {
    "credentials.json".to_string()
}
fn default_client_connect_timeout() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            page_size: default_page_size(),
            credentials_path: default_credentials_path(),
            connect_timeout: default_client_connect_timeout(),
        }
    }
}

impl ClientConfig {
    /// Relay chat endpoint.
    #[must_use]
    pub fn chat_endpoint(&self) -> String {
        format!("{}/api/ai-proxy/chat", self.relay_url.trim_end_matches('/'))
    }

    /// Base URL for backend calls routed through the relay.
    #[must_use]
    pub fn backend_endpoint(&self) -> String {
        format!("{}/api/backend", self.relay_url.trim_end_matches('/'))
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl AppConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(UPSTREAM_API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.upstream.api_key = key;
            }
        }
    }
}

/// Load configuration from a YAML file and validate it.
///
/// `upstream.api_key` may be supplied through [`UPSTREAM_API_KEY_ENV`]
/// instead of the file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let mut config: AppConfig = serde_yaml::from_str(contents)?;
    config.apply_env_overrides();
    validate_config(&config)?;
    Ok(config)
}

/// The sections read by the chat CLI. Relay sections in the same file are
/// ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load the client sections from a YAML file. A missing file yields the
/// defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for unreadable files, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`].
pub fn load_client_config(path: &str) -> Result<ClientAppConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str(&contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ClientAppConfig::default(),
        Err(err) => return Err(err.into()),
    };
    validate_client_config(&config)?;
    Ok(config)
}
