//! Session/message persistence backend.
//!
//! [`SessionBackend`] is the seam the session manager talks through;
//! [`HttpSessionBackend`] is the production implementation reaching the
//! backend through the relay's `/api/backend` proxy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use http::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::error::BackendError;
use super::Message;
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::util::deserialize_opt_id;

/// Session as returned by the backend. Every field is optional; the manager
/// fills gaps when normalizing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "updatedAt",
        deserialize_with = "deserialize_opt_timestamp"
    )]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub conversation_id: Option<String>,
}

/// Message as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub is_user: Option<bool>,
    /// Older rows carry `role: "user" | "assistant"` instead of `isUser`.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub message_id: Option<String>,
}

impl MessageRecord {
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.is_user
            .unwrap_or_else(|| self.role.as_deref().is_some_and(|r| r.eq_ignore_ascii_case("user")))
    }
}

/// Persistence operations used by the session manager.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>, BackendError>;

    async fn create_session(&self, user_id: &str, title: &str)
        -> Result<SessionRecord, BackendError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), BackendError>;

    /// Newest `limit` messages of a session, in any order.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, BackendError>;

    /// Up to `limit` messages strictly older than `before_id`.
    async fn messages_before(
        &self,
        session_id: &str,
        before_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, BackendError>;

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<(), BackendError>;

    async fn update_title(&self, session_id: &str, title: &str) -> Result<(), BackendError>;
}

/// [`SessionBackend`] over HTTP with bearer auth from the credential store.
pub struct HttpSessionBackend {
    http: reqwest::Client,
    base_url: url::Url,
    credentials: Arc<CredentialStore>,
}

impl HttpSessionBackend {
    /// # Errors
    ///
    /// Returns [`BackendError::Decode`] for an unusable relay URL and
    /// [`BackendError::Network`] when the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, credentials: Arc<CredentialStore>) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_secs(config.connect_timeout.saturating_mul(3)))
            .build()
            .map_err(|err| BackendError::from_transport(&err))?;
        Self::with_http_client(http, &config.backend_endpoint(), credentials)
    }

    /// # Errors
    ///
    /// Returns [`BackendError::Decode`] when `base_url` cannot be parsed.
    pub fn with_http_client(
        http: reqwest::Client,
        base_url: &str,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, BackendError> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| BackendError::Decode(format!("invalid backend URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Decode(format!(
                "backend URL '{base_url}' cannot carry a path"
            )));
        }
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> url::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Authenticated request. A 401 signs the user out.
    ///
    /// Returns `None` for an empty success body.
    async fn fetch_with_auth(
        &self,
        method: http::Method,
        url: url::Url,
        body: Option<Value>,
    ) -> Result<Option<Value>, BackendError> {
        let token = self.credentials.token().ok_or(BackendError::NotSignedIn)?;

        let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(token);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| BackendError::from_transport(&err))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(%method, path = url.path(), "backend rejected token; signing out");
            if let Err(err) = self.credentials.clear() {
                tracing::error!(error = %err, "failed to clear stored credentials");
            }
            return Err(BackendError::Unauthorized);
        }

        let text = response
            .text()
            .await
            .map_err(|err| BackendError::from_transport(&err))?;
        if !status.is_success() {
            tracing::debug!(%method, path = url.path(), status = status.as_u16(), "backend request failed");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| BackendError::Decode(format!("{} {}: {e}", method, url.path())))
    }
}

#[async_trait]
impl SessionBackend for HttpSessionBackend {
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>, BackendError> {
        let mut url = self.endpoint(&["sessions"]);
        url.query_pairs_mut().append_pair("userId", user_id);
        let body = self.fetch_with_auth(http::Method::GET, url, None).await?;
        decode_list(body)
    }

    async fn create_session(
        &self,
        user_id: &str,
        title: &str,
    ) -> Result<SessionRecord, BackendError> {
        let url = self.endpoint(&["sessions"]);
        let body = self
            .fetch_with_auth(
                http::Method::POST,
                url,
                Some(json!({ "userId": user_id, "title": title })),
            )
            .await?;
        match body.map(unwrap_data) {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| BackendError::Decode(format!("session record: {e}"))),
            None => Ok(SessionRecord::default()),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["sessions", session_id, "delete"]);
        self.fetch_with_auth(http::Method::POST, url, None).await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        let mut url = self.endpoint(&["sessions", session_id, "messages", "recent"]);
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        let body = self.fetch_with_auth(http::Method::GET, url, None).await?;
        decode_list(body)
    }

    async fn messages_before(
        &self,
        session_id: &str,
        before_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        let mut url = self.endpoint(&["sessions", session_id, "messages"]);
        url.query_pairs_mut()
            .append_pair("before", before_id)
            .append_pair("limit", &limit.to_string());
        let body = self.fetch_with_auth(http::Method::GET, url, None).await?;
        decode_list(body)
    }

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<(), BackendError> {
        let url = self.endpoint(&["sessions", session_id, "messages"]);
        let payload = serde_json::to_value(message)
            .map_err(|e| BackendError::Decode(format!("message encode: {e}")))?;
        self.fetch_with_auth(http::Method::POST, url, Some(payload))
            .await?;
        Ok(())
    }

    async fn update_title(&self, session_id: &str, title: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["sessions", session_id, "title"]);
        self.fetch_with_auth(http::Method::POST, url, Some(json!({ "title": title })))
            .await?;
        Ok(())
    }
}

/// Some endpoints wrap their payload as `{"data": ...}`.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn decode_list<T: serde::de::DeserializeOwned>(body: Option<Value>) -> Result<Vec<T>, BackendError> {
    match body.map(unwrap_data) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value @ Value::Array(_)) => serde_json::from_value(value)
            .map_err(|e| BackendError::Decode(format!("list payload: {e}"))),
        Some(other) => Err(BackendError::Decode(format!(
            "expected a JSON array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Timestamps arrive as RFC 3339, as zone-less ISO local times (taken as
/// UTC), or as epoch milliseconds. Unparseable values become `None`.
fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp))
}

pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_record_is_lenient() {
        let record: SessionRecord = serde_json::from_value(json!({
            "id": 12,
            "userId": "7",
            "title": null,
            "createdAt": "2025-03-01T09:00:00",
            "updatedAt": 1_740_820_000_000_i64,
            "unknownField": true
        }))
        .unwrap();
        assert_eq!(record.id.as_deref(), Some("12"));
        assert_eq!(record.title, None);
        assert_eq!(
            record.created_at.unwrap().to_rfc3339(),
            "2025-03-01T09:00:00+00:00"
        );
        assert!(record.last_updated_at.is_some());
        assert_eq!(record.conversation_id, None);
    }

    #[test]
    fn test_message_record_role_fallback() {
        let user: MessageRecord =
            serde_json::from_value(json!({"id": "a", "role": "user", "content": "hi"})).unwrap();
        assert!(user.is_user());
        let bot: MessageRecord =
            serde_json::from_value(json!({"id": "b", "isUser": false, "content": "hello"}))
                .unwrap();
        assert!(!bot.is_user());
        let bad_time: MessageRecord =
            serde_json::from_value(json!({"timestamp": "yesterday"})).unwrap();
        assert_eq!(bad_time.timestamp, None);
    }

    #[test]
    fn test_decode_list_shapes() {
        let wrapped: Vec<SessionRecord> =
            decode_list(Some(json!({"data": [{"id": "s1"}]}))).unwrap();
        assert_eq!(wrapped.len(), 1);
        let bare: Vec<SessionRecord> = decode_list(Some(json!([]))).unwrap();
        assert!(bare.is_empty());
        let empty: Vec<SessionRecord> = decode_list(None).unwrap();
        assert!(empty.is_empty());
        assert!(decode_list::<SessionRecord>(Some(json!({"id": "x"}))).is_err());
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let store = Arc::new(CredentialStore::new("unused.json"));
        let backend = HttpSessionBackend::with_http_client(
            reqwest::Client::new(),
            "http://127.0.0.1:3001/api/backend/",
            store,
        )
        .unwrap();
        let url = backend.endpoint(&["sessions", "a/b c", "messages"]);
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:3001/api/backend/sessions/a%2Fb%20c/messages"
        );
    }
}
