use tokio_util::sync::CancellationToken;

use super::{Message, SessionBackend, SessionError, SessionManager};
use crate::classify::classify;
use crate::client::{ChatRequest, ChatStreamClient};
use crate::error::{ChatError, ErrorCategory};
use crate::stream::StreamFragment;

/// How a chat turn ended. The user message is in the conversation in every
/// case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed {
        reply: Message,
        /// Persistence failures; the conversation is unaffected.
        warnings: Vec<String>,
    },
    Failed {
        category: ErrorCategory,
        /// Text shown in place of the assistant reply.
        message: String,
        retry_label: &'static str,
        detail: String,
        warnings: Vec<String>,
    },
    Cancelled {
        partial: String,
    },
}

/// One question/answer exchange on the current session.
pub struct ChatTurn<'a, B> {
    manager: &'a SessionManager<B>,
    client: &'a ChatStreamClient,
    endpoint: &'a str,
    token: &'a str,
}

impl<'a, B: SessionBackend + 'static> ChatTurn<'a, B> {
    #[must_use]
    pub fn new(
        manager: &'a SessionManager<B>,
        client: &'a ChatStreamClient,
        endpoint: &'a str,
        token: &'a str,
    ) -> Self {
        Self {
            manager,
            client,
            endpoint,
            token,
        }
    }

    /// Append the user's message, stream the answer and append the reply.
    ///
    /// Request failures are classified into [`TurnOutcome::Failed`] rather
    /// than returned as errors.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoCurrentSession`], [`SessionError::EmptyMessage`] or
    /// a session lookup failure.
    pub async fn send<F>(
        &self,
        query: &str,
        cancel: &CancellationToken,
        mut on_fragment: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&StreamFragment),
    {
        let session_id = self
            .manager
            .current_session_id()
            .ok_or(SessionError::NoCurrentSession)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let user_message = Message::user(query);
        let user_message_id = user_message.id.clone();
        self.manager.append_message(&session_id, user_message)?;

        let mut warnings = Vec::new();
        if let Err(err) = self.manager.persist_message(&session_id, &user_message_id).await {
            warnings.push(err.to_string());
        }

        let conversation_id = self
            .manager
            .session(&session_id)
            .and_then(|s| s.conversation_id);
        let request = ChatRequest::streaming(query, self.manager.user_id())
            .with_conversation(conversation_id.as_deref());

        let mut partial = String::new();
        let result = self
            .client
            .consume(self.endpoint, &request, self.token, cancel, |fragment| {
                partial.push_str(&fragment.text);
                on_fragment(fragment);
            })
            .await;

        match result {
            Ok(outcome) => {
                let mut reply = Message::assistant(outcome.full_message);
                reply.conversation_id.clone_from(&outcome.conversation_id);
                reply.message_id.clone_from(&outcome.message_id);
                let reply_id = reply.id.clone();
                self.manager.append_message(&session_id, reply.clone())?;
                self.manager.attach_correlation(
                    &session_id,
                    &user_message_id,
                    outcome.conversation_id.as_deref(),
                    None,
                )?;
                if let Err(err) = self.manager.persist_message(&session_id, &reply_id).await {
                    warnings.push(err.to_string());
                }
                Ok(TurnOutcome::Completed { reply, warnings })
            }
            Err(ChatError::Cancelled) => {
                tracing::debug!(session_id = %session_id, "chat turn cancelled");
                Ok(TurnOutcome::Cancelled { partial })
            }
            Err(err) => {
                let category = classify(&err);
                tracing::warn!(
                    session_id = %session_id,
                    category = %category,
                    error = %err,
                    "chat turn failed"
                );
                Ok(TurnOutcome::Failed {
                    category,
                    message: category.user_message().to_string(),
                    retry_label: category.retry_label(),
                    detail: err.to_string(),
                    warnings,
                })
            }
        }
    }
}
