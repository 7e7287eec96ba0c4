use super::{AppConfig, ClientAppConfig, ClientConfig, ConfigError, FeaturesConfig};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_backend(config)?;
    validate_client(&config.client)?;
    validate_log_level(&config.features)?;
    Ok(())
}

/// Validate the sections the chat CLI reads.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any client setting is invalid.
pub fn validate_client_config(config: &ClientAppConfig) -> Result<(), ConfigError> {
    validate_client(&config.client)?;
    validate_log_level(&config.features)
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(validation_err(format!(
            "{field} must start with http:// or https://"
        )));
    }
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| validation_err(format!("{field} is not a valid URL: {e}")))
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    validate_http_url("upstream.base_url", &config.upstream.base_url)?;
    if config.upstream.api_key.trim().is_empty() {
        return Err(validation_err(format!(
            "upstream.api_key cannot be empty (set it in the file or via {})",
            super::UPSTREAM_API_KEY_ENV
        )));
    }
    if !config.upstream.chat_path.starts_with('/') {
        return Err(validation_err("upstream.chat_path must start with '/'"));
    }
    Ok(())
}

fn validate_backend(config: &AppConfig) -> Result<(), ConfigError> {
    validate_http_url("backend.base_url", &config.backend.base_url)
}

fn validate_client(client: &ClientConfig) -> Result<(), ConfigError> {
    validate_http_url("client.relay_url", &client.relay_url)?;
    if client.page_size == 0 {
        return Err(validation_err("client.page_size must be greater than 0"));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "DEBUG", "INFO", "WARNING", "WARN", "ERROR", "CRITICAL", "TRACE", "DISABLED",
];

fn validate_log_level(features: &FeaturesConfig) -> Result<(), ConfigError> {
    let level = features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackendConfig, ClientConfig, FeaturesConfig, ServerConfig, UpstreamConfig,
    };

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                base_url: "https://ai.example.edu".to_string(),
                api_key: "app-secret".to_string(),
                chat_path: "/v1/chat-messages".to_string(),
            },
            backend: BackendConfig {
                base_url: "http://127.0.0.1:8080/api".to_string(),
            },
            client: ClientConfig::default(),
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let mut config = valid_config();
        config.upstream.api_key = "  ".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("upstream.api_key"));
    }

    #[test]
    fn test_bad_upstream_url_rejected() {
        let mut config = valid_config();
        config.upstream.base_url = "ftp://ai.example.edu".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_chat_path_must_be_absolute() {
        let mut config = valid_config();
        config.upstream.chat_path = "v1/chat-messages".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let mut config = valid_config();
        config.client.page_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_client_only_config() {
        let mut config = ClientAppConfig::default();
        assert!(validate_client_config(&config).is_ok());
        config.client.relay_url = "127.0.0.1:3001".to_string();
        assert!(validate_client_config(&config).is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = valid_config();
        config.features.log_level = "warning".to_string();
        assert!(validate_config(&config).is_ok());
        config.features.log_level = "LOUD".to_string();
        assert!(validate_config(&config).is_err());
    }
}
