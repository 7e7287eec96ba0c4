//! Session list, per-session message pages and the current selection.
//!
//! All state lives in one [`SessionManager`]. Locks are only held between
//! awaits, never across a backend call. Guarded operations (list load,
//! message load, create, delete) are serialized by a [`Phase`] value: a
//! second one started while another runs fails with [`SessionError::Busy`].

pub mod backend;
mod error;
pub mod title;
pub mod turn;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub use backend::{HttpSessionBackend, MessageRecord, SessionBackend, SessionRecord};
pub use error::{BackendError, SessionError};
pub use title::{derive_title, DEFAULT_TITLE};
pub use turn::{ChatTurn, TurnOutcome};

use crate::util::new_local_id;

pub const DEFAULT_PAGE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Creating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Loading => "loading",
            Phase::Creating => "creating",
        })
    }
}

/// One chat message. Only the correlation ids change after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub is_user: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Message {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(true, content.into())
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(false, content.into())
    }

    fn new(is_user: bool, content: String) -> Self {
        Self {
            id: new_local_id(),
            is_user,
            content,
            timestamp: Utc::now(),
            conversation_id: None,
            message_id: None,
        }
    }

    fn from_record(record: MessageRecord, now: DateTime<Utc>) -> Self {
        let is_user = record.is_user();
        Self {
            id: record.id.unwrap_or_else(new_local_id),
            is_user,
            content: record.content,
            timestamp: record.timestamp.unwrap_or(now),
            conversation_id: record.conversation_id,
            message_id: record.message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    /// Ascending by timestamp.
    pub messages: Vec<Message>,
    /// Cursor for the next backfill page.
    pub oldest_message_id: Option<String>,
    pub has_more_older: bool,
    pub is_loading_older: bool,
    pub messages_loaded: bool,
}

impl ChatSession {
    fn from_record(record: SessionRecord, user_id: &str, now: DateTime<Utc>) -> Self {
        let created_at = record.created_at.or(record.last_updated_at).unwrap_or(now);
        Self {
            id: record.id.unwrap_or_else(new_local_id),
            user_id: record.user_id.unwrap_or_else(|| user_id.to_string()),
            title: title::normalize_title(record.title.as_deref()),
            created_at,
            last_updated_at: record.last_updated_at.unwrap_or(created_at),
            conversation_id: record.conversation_id,
            messages: Vec::new(),
            oldest_message_id: None,
            has_more_older: true,
            is_loading_older: false,
            messages_loaded: false,
        }
    }
}

/// Result of loading a session's newest page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagesOutcome {
    /// The session has no history; show the greeting.
    Empty,
    Loaded { count: usize },
}

/// Where the view should stay after older messages were prepended: the
/// message that was first before the backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollAnchor {
    pub anchor_message_id: String,
    pub prepended: usize,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: Phase,
    /// Descending by `last_updated_at`.
    sessions: Vec<ChatSession>,
    current: Option<String>,
    /// The only session allowed to backfill, always the selected one.
    backfill_listener: Option<String>,
}

impl SessionState {
    fn session_mut(&mut self, id: &str) -> Result<&mut ChatSession, SessionError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    fn sort(&mut self) {
        self.sessions
            .sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
    }

    fn select(&mut self, id: &str) {
        if self.backfill_listener.as_deref() != Some(id) {
            if let Some(previous) = self.backfill_listener.take() {
                tracing::trace!(session_id = %previous, "backfill listener detached");
            }
            self.backfill_listener = Some(id.to_string());
        }
        self.current = Some(id.to_string());
    }
}

/// Resets the phase to idle however the guarded operation ends.
struct PhaseGuard<'a> {
    state: &'a Mutex<SessionState>,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().phase = Phase::Idle;
    }
}

/// Clears `is_loading_older` if a backfill is dropped mid-request.
struct LoadingOlderGuard<'a> {
    state: &'a Mutex<SessionState>,
    session_id: &'a str,
}

impl Drop for LoadingOlderGuard<'_> {
    fn drop(&mut self) {
        if let Ok(session) = self.state.lock().session_mut(self.session_id) {
            session.is_loading_older = false;
        }
    }
}

pub struct SessionManager<B> {
    backend: Arc<B>,
    user_id: String,
    page_size: usize,
    state: Mutex<SessionState>,
}

impl<B: SessionBackend + 'static> SessionManager<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, user_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            backend,
            user_id: user_id.into(),
            page_size: page_size.max(1),
            state: Mutex::new(SessionState::default()),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Snapshot of the session list, most recently updated first.
    #[must_use]
    pub fn sessions(&self) -> Vec<ChatSession> {
        self.state.lock().sessions.clone()
    }

    #[must_use]
    pub fn session(&self, id: &str) -> Option<ChatSession> {
        self.state.lock().sessions.iter().find(|s| s.id == id).cloned()
    }

    #[must_use]
    pub fn current_session_id(&self) -> Option<String> {
        self.state.lock().current.clone()
    }

    #[must_use]
    pub fn current_session(&self) -> Option<ChatSession> {
        let state = self.state.lock();
        let id = state.current.as_deref()?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    #[must_use]
    pub fn backfill_listener(&self) -> Option<String> {
        self.state.lock().backfill_listener.clone()
    }

    fn begin(&self, phase: Phase) -> Result<PhaseGuard<'_>, SessionError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return Err(SessionError::Busy(state.phase));
        }
        state.phase = phase;
        Ok(PhaseGuard { state: &self.state })
    }

    /// Fetch the user's sessions and select the most recent one.
    ///
    /// A user with no sessions gets exactly one new session.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`] when another guarded operation runs, or the
    /// backend failure.
    pub async fn load_sessions(&self) -> Result<(), SessionError> {
        let _guard = self.begin(Phase::Loading)?;
        let records = self.backend.list_sessions(&self.user_id).await?;

        if records.is_empty() {
            tracing::info!(user_id = %self.user_id, "no sessions yet; creating the first one");
            {
                let mut state = self.state.lock();
                state.sessions.clear();
                state.current = None;
                state.backfill_listener = None;
            }
            self.create_session_unguarded().await?;
            return Ok(());
        }

        let now = Utc::now();
        let mut sessions: Vec<ChatSession> = Vec::with_capacity(records.len());
        for record in records {
            let session = ChatSession::from_record(record, &self.user_id, now);
            if sessions.iter().any(|s| s.id == session.id) {
                tracing::debug!(session_id = %session.id, "duplicate session in list; skipped");
                continue;
            }
            sessions.push(session);
        }

        let most_recent = {
            let mut state = self.state.lock();
            state.sessions = sessions;
            state.sort();
            state.current = None;
            state.backfill_listener = None;
            state.sessions.first().map(|s| s.id.clone())
        };
        tracing::debug!(user_id = %self.user_id, "session list loaded");

        if let Some(id) = most_recent {
            self.select_unguarded(&id).await?;
        }
        Ok(())
    }

    /// Load the newest page of a session's messages.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`], [`SessionError::UnknownSession`] or the backend
    /// failure.
    pub async fn load_messages(&self, session_id: &str) -> Result<MessagesOutcome, SessionError> {
        let _guard = self.begin(Phase::Loading)?;
        self.load_messages_unguarded(session_id).await
    }

    async fn load_messages_unguarded(&self, session_id: &str) -> Result<MessagesOutcome, SessionError> {
        if self.session(session_id).is_none() {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }
        let page = self
            .backend
            .recent_messages(session_id, self.page_size)
            .await?;
        let full_page = page.len() >= self.page_size;
        let now = Utc::now();
        let mut messages: Vec<Message> = Vec::with_capacity(page.len());
        for record in page {
            let message = Message::from_record(record, now);
            if !messages.iter().any(|m| m.id == message.id) {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| m.timestamp);

        let (outcome, new_title) = {
            let mut state = self.state.lock();
            let session = state.session_mut(session_id)?;
            session.messages_loaded = true;
            if messages.is_empty() {
                session.messages.clear();
                session.oldest_message_id = None;
                session.has_more_older = false;
                (MessagesOutcome::Empty, None)
            } else {
                session.oldest_message_id = messages.first().map(|m| m.id.clone());
                session.has_more_older = full_page;
                if session.conversation_id.is_none() {
                    session.conversation_id =
                        messages.iter().rev().find_map(|m| m.conversation_id.clone());
                }
                let count = messages.len();
                session.messages = messages;
                let new_title = derive_title(&session.messages).filter(|t| *t != session.title);
                if let Some(title) = &new_title {
                    session.title.clone_from(title);
                }
                (MessagesOutcome::Loaded { count }, new_title)
            }
        };

        if let Some(title) = new_title {
            if let Err(err) = self.backend.update_title(session_id, &title).await {
                tracing::warn!(session_id, error = %err, "failed to write derived title");
            }
        }
        tracing::debug!(session_id, ?outcome, "messages loaded");
        Ok(outcome)
    }

    /// Prepend the next page of older messages to the selected session.
    ///
    /// Returns `None` without touching the network when the session is not
    /// the selected one, has nothing older, or is already backfilling.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownSession`] or the backend failure.
    pub async fn backfill_older(&self, session_id: &str) -> Result<Option<ScrollAnchor>, SessionError> {
        let cursor = {
            let mut state = self.state.lock();
            if state.backfill_listener.as_deref() != Some(session_id) {
                tracing::trace!(session_id, "backfill ignored for unselected session");
                return Ok(None);
            }
            let session = state.session_mut(session_id)?;
            if !session.has_more_older || session.is_loading_older {
                return Ok(None);
            }
            let Some(cursor) = session.oldest_message_id.clone() else {
                session.has_more_older = false;
                return Ok(None);
            };
            session.is_loading_older = true;
            cursor
        };

        let loading = LoadingOlderGuard {
            state: &self.state,
            session_id,
        };
        let result = self
            .backend
            .messages_before(session_id, &cursor, self.page_size)
            .await;
        drop(loading);
        let page = result?;
        let full_page = page.len() >= self.page_size;
        let now = Utc::now();

        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        let mut older: Vec<Message> = Vec::with_capacity(page.len());
        for record in page {
            let message = Message::from_record(record, now);
            let known = session.messages.iter().any(|m| m.id == message.id)
                || older.iter().any(|m| m.id == message.id);
            if !known {
                older.push(message);
            }
        }
        older.sort_by_key(|m| m.timestamp);
        session.has_more_older = full_page && !older.is_empty();

        let Some(first_new) = older.first() else {
            return Ok(None);
        };
        session.oldest_message_id = Some(first_new.id.clone());
        let anchor = session.messages.first().map(|m| m.id.clone());
        let prepended = older.len();
        older.append(&mut session.messages);
        session.messages = older;
        tracing::debug!(session_id, prepended, has_more_older = session.has_more_older, "older messages prepended");

        Ok(anchor.map(|anchor_message_id| ScrollAnchor {
            anchor_message_id,
            prepended,
        }))
    }

    /// Make `session_id` current. Messages load on first selection; the
    /// returned outcome is `Some` only then.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`], [`SessionError::UnknownSession`] or the backend
    /// failure.
    pub async fn select_session(&self, session_id: &str) -> Result<Option<MessagesOutcome>, SessionError> {
        let _guard = self.begin(Phase::Loading)?;
        self.select_unguarded(session_id).await
    }

    async fn select_unguarded(&self, session_id: &str) -> Result<Option<MessagesOutcome>, SessionError> {
        let needs_load = {
            let mut state = self.state.lock();
            let loaded = state.session_mut(session_id)?.messages_loaded;
            state.select(session_id);
            !loaded
        };
        if needs_load {
            return self.load_messages_unguarded(session_id).await.map(Some);
        }
        Ok(None)
    }

    /// Create a session, put it first and select it. Returns its id.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`] or the backend failure.
    pub async fn create_session(&self) -> Result<String, SessionError> {
        let _guard = self.begin(Phase::Creating)?;
        self.create_session_unguarded().await
    }

    async fn create_session_unguarded(&self) -> Result<String, SessionError> {
        let record = self
            .backend
            .create_session(&self.user_id, DEFAULT_TITLE)
            .await?;
        let mut session = ChatSession::from_record(record, &self.user_id, Utc::now());
        session.messages_loaded = true;
        session.has_more_older = false;
        let id = session.id.clone();

        let mut state = self.state.lock();
        state.sessions.retain(|s| s.id != id);
        state.sessions.insert(0, session);
        state.sort();
        state.select(&id);
        tracing::info!(session_id = %id, "session created");
        Ok(id)
    }

    /// Delete a session. When it was selected, the most recent remaining
    /// session is selected instead, or a new one is created if none remain.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`], [`SessionError::UnknownSession`] or the backend
    /// failure.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        let _guard = self.begin(Phase::Loading)?;
        if self.session(session_id).is_none() {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }
        self.backend.delete_session(session_id).await?;

        let successor = {
            let mut state = self.state.lock();
            state.sessions.retain(|s| s.id != session_id);
            if state.backfill_listener.as_deref() == Some(session_id) {
                state.backfill_listener = None;
            }
            let was_current = state.current.as_deref() == Some(session_id);
            if was_current || state.current.is_none() {
                state.current = None;
                Some(state.sessions.first().map(|s| s.id.clone()))
            } else {
                None
            }
        };
        tracing::info!(session_id, "session deleted");

        match successor {
            None => Ok(()),
            Some(Some(next)) => self.select_unguarded(&next).await.map(|_| ()),
            Some(None) => self.create_session_unguarded().await.map(|_| ()),
        }
    }

    /// Append a message. Appending an id that is already present is a no-op
    /// and returns `false`.
    ///
    /// A user message re-derives the title; the new title is written to the
    /// backend in the background and a failure there is only logged.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownSession`].
    pub fn append_message(&self, session_id: &str, message: Message) -> Result<bool, SessionError> {
        let new_title = {
            let mut state = self.state.lock();
            let session = state.session_mut(session_id)?;
            if session.messages.iter().any(|m| m.id == message.id) {
                return Ok(false);
            }
            if session.conversation_id.is_none() {
                session.conversation_id.clone_from(&message.conversation_id);
            }
            let is_user = message.is_user;
            let at = session
                .messages
                .partition_point(|m| m.timestamp <= message.timestamp);
            session.messages.insert(at, message);
            session.last_updated_at = Utc::now().max(session.last_updated_at);

            let new_title = if is_user {
                derive_title(&session.messages).filter(|t| *t != session.title)
            } else {
                None
            };
            if let Some(title) = &new_title {
                session.title.clone_from(title);
            }
            state.sort();
            new_title
        };

        if let Some(title) = new_title {
            self.spawn_title_write(session_id, title);
        }
        Ok(true)
    }

    fn spawn_title_write(&self, session_id: &str, title: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(session_id, "no runtime; derived title kept locally");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let session_id = session_id.to_string();
        handle.spawn(async move {
            if let Err(err) = backend.update_title(&session_id, &title).await {
                tracing::warn!(session_id = %session_id, error = %err, "failed to write derived title");
            }
        });
    }

    /// Record upstream correlation ids once a stream completes.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownSession`] or [`SessionError::UnknownMessage`].
    pub fn attach_correlation(
        &self,
        session_id: &str,
        local_message_id: &str,
        conversation_id: Option<&str>,
        upstream_message_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        if let Some(conversation_id) = conversation_id {
            session.conversation_id = Some(conversation_id.to_string());
        }
        let message = session
            .messages
            .iter_mut()
            .find(|m| m.id == local_message_id)
            .ok_or_else(|| SessionError::UnknownMessage(local_message_id.to_string()))?;
        if let Some(conversation_id) = conversation_id {
            message.conversation_id = Some(conversation_id.to_string());
        }
        if let Some(upstream_message_id) = upstream_message_id {
            message.message_id = Some(upstream_message_id.to_string());
        }
        Ok(())
    }

    /// Save a message to the backend.
    ///
    /// A failure is logged and returned for the caller to show as a warning;
    /// the message stays in the conversation either way.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownSession`], [`SessionError::UnknownMessage`] or
    /// the backend failure.
    pub async fn persist_message(&self, session_id: &str, message_id: &str) -> Result<(), SessionError> {
        let message = {
            let mut state = self.state.lock();
            state
                .session_mut(session_id)?
                .messages
                .iter()
                .find(|m| m.id == message_id)
                .cloned()
                .ok_or_else(|| SessionError::UnknownMessage(message_id.to_string()))?
        };
        if let Err(err) = self.backend.save_message(session_id, &message).await {
            tracing::warn!(session_id, message_id, error = %err, "failed to persist message");
            return Err(err.into());
        }
        Ok(())
    }

    /// Rename a session locally and on the backend.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownSession`] or the backend failure.
    pub async fn update_title(&self, session_id: &str, title: &str) -> Result<(), SessionError> {
        let title = title::normalize_title(Some(title));
        {
            let mut state = self.state.lock();
            state.session_mut(session_id)?.title.clone_from(&title);
            state.sort();
        }
        self.backend.update_title(session_id, &title).await?;
        Ok(())
    }
}
