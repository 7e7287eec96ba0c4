//! Client for the relay's streaming chat endpoint.
//!
//! [`ChatStreamClient::consume`] drives one request: it sends the JSON body,
//! feeds every network read through [`FragmentDecoder`], reports each
//! fragment as soon as it is decoded and resolves with the accumulated answer.

use std::time::Duration;

use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{error_chain_message, ChatError};
use crate::stream::{FragmentDecoder, StreamFragment};

/// Answer text used when a stream completes without any text fragment.
pub const NO_CONTENT_PLACEHOLDER: &str =
    "Sorry, I could not find an answer to that. Please try rephrasing your question.";

const EVENT_STREAM: &str = "text/event-stream";

/// Body of a streaming chat request, passed through the relay unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
    pub response_mode: String,
    pub user: String,
    /// Empty starts a new upstream conversation.
    pub conversation_id: String,
}

impl ChatRequest {
    #[must_use]
    pub fn streaming(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            inputs: serde_json::Map::new(),
            query: query.into(),
            response_mode: "streaming".to_string(),
            user: user.into(),
            conversation_id: String::new(),
        }
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: Option<&str>) -> Self {
        self.conversation_id = conversation_id.unwrap_or_default().to_string();
        self
    }
}

/// Result of a completed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub full_message: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    /// Number of fragments that carried text.
    pub text_fragments: usize,
}

impl StreamOutcome {
    fn absorb(&mut self, fragment: &StreamFragment) {
        if fragment.has_text() {
            self.full_message.push_str(&fragment.text);
            self.text_fragments += 1;
        }
        if let Some(id) = &fragment.conversation_id {
            self.conversation_id = Some(id.clone());
        }
        if let Some(id) = &fragment.message_id {
            self.message_id = Some(id.clone());
        }
    }

    /// True when the answer is the substituted placeholder.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.text_fragments == 0
    }
}

pub struct ChatStreamClient {
    http: reqwest::Client,
}

impl ChatStreamClient {
    /// Build a client with the configured connect timeout.
    ///
    /// No total timeout is set: answers may stream for minutes, and the
    /// caller bounds the turn with a [`CancellationToken`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Network`] when the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .tcp_nodelay(true)
            .build()
            .map_err(|err| ChatError::from_transport(&err))?;
        Ok(Self { http })
    }

    #[must_use]
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Send `request` and consume the event stream to completion.
    ///
    /// `on_fragment` is called once per decoded fragment, in stream order,
    /// including fragments that only carry correlation ids.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Status`] for a non-success response head; the body is
    ///   read in full first.
    /// - [`ChatError::Network`] when no response arrives.
    /// - [`ChatError::Interrupted`] when the body fails mid-stream.
    /// - [`ChatError::Cancelled`] as soon as `cancel` fires.
    pub async fn consume<F>(
        &self,
        endpoint: &str,
        request: &ChatRequest,
        token: &str,
        cancel: &CancellationToken,
        mut on_fragment: F,
    ) -> Result<StreamOutcome, ChatError>
    where
        F: FnMut(&StreamFragment),
    {
        if request.query.trim().is_empty() {
            return Err(ChatError::InvalidRequest("query is empty".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }

        let send = self
            .http
            .post(endpoint)
            .header(ACCEPT, EVENT_STREAM)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(token)
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ChatError::Cancelled),
            result = send => result.map_err(|err| ChatError::from_transport(&err))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChatError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            tracing::debug!(status = status.as_u16(), "chat request rejected");
            return Err(ChatError::from_status(status.as_u16(), body));
        }

        let mut body = std::pin::pin!(response.bytes_stream());
        let mut decoder = FragmentDecoder::new();
        let mut outcome = StreamOutcome::default();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(received = outcome.full_message.len(), "chat stream cancelled");
                    return Err(ChatError::Cancelled);
                }
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for fragment in decoder.push_bytes(&chunk) {
                        outcome.absorb(&fragment);
                        on_fragment(&fragment);
                    }
                }
                Some(Err(err)) => {
                    return Err(ChatError::Interrupted(error_chain_message(&err)));
                }
                None => break,
            }
        }

        for fragment in decoder.finish() {
            outcome.absorb(&fragment);
            on_fragment(&fragment);
        }

        if outcome.full_message.is_empty() {
            tracing::info!("chat stream ended without text; using placeholder");
            outcome.full_message = NO_CONTENT_PLACEHOLDER.to_string();
        }
        tracing::debug!(
            fragments = outcome.text_fragments,
            chars = outcome.full_message.chars().count(),
            conversation_id = outcome.conversation_id.as_deref().unwrap_or(""),
            "chat stream complete"
        );
        Ok(outcome)
    }

    /// Callback form of [`Self::consume`]. Exactly one of `on_complete` and
    /// `on_error` is called.
    #[allow(clippy::too_many_arguments)]
    pub async fn consume_with_callbacks<F, C, E>(
        &self,
        endpoint: &str,
        request: &ChatRequest,
        token: &str,
        cancel: &CancellationToken,
        on_fragment: F,
        on_complete: C,
        on_error: E,
    ) where
        F: FnMut(&StreamFragment),
        C: FnOnce(StreamOutcome),
        E: FnOnce(ChatError),
    {
        match self.consume(endpoint, request, token, cancel, on_fragment).await {
            Ok(outcome) => on_complete(outcome),
            Err(err) => on_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = ChatRequest::streaming("How do I apply?", "user-7")
            .with_conversation(Some("conv-1"));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_mode"], "streaming");
        assert_eq!(value["conversation_id"], "conv-1");
        assert_eq!(value["inputs"], serde_json::json!({}));

        let fresh = ChatRequest::streaming("hi", "u").with_conversation(None);
        assert_eq!(serde_json::to_value(&fresh).unwrap()["conversation_id"], "");
    }

    #[test]
    fn test_outcome_last_id_wins() {
        let mut outcome = StreamOutcome::default();
        outcome.absorb(&StreamFragment {
            text: "a".into(),
            conversation_id: Some("c1".into()),
            message_id: None,
        });
        outcome.absorb(&StreamFragment {
            text: String::new(),
            conversation_id: Some("c2".into()),
            message_id: Some("m".into()),
        });
        assert_eq!(outcome.full_message, "a");
        assert_eq!(outcome.text_fragments, 1);
        assert_eq!(outcome.conversation_id.as_deref(), Some("c2"));
        assert_eq!(outcome.message_id.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected_before_sending() {
        let client = ChatStreamClient::with_http_client(reqwest::Client::new());
        let err = client
            .consume(
                "http://127.0.0.1:9/api/ai-proxy/chat",
                &ChatRequest::streaming("   ", "u"),
                "t",
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }
}
