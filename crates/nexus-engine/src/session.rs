//! Persisted conversation sessions.
//!
//! `SessionStore` owns every persisted `Session` and is their only
//! mutator. Mutations are strictly ordered by call sequence (the
//! orchestrator's one-in-flight discipline is the only writer), and a
//! durable write follows every structural change. A storage failure is
//! logged and the in-memory copy stays authoritative.

use std::sync::Arc;

use tracing::{debug, warn};

use nexus_common::{new_id, now_ms, Message, Session};

use crate::storage::{keys, KvStore};

/// Length budget for titles derived from a first user message.
const TITLE_MAX_CHARS: usize = 30;

const DEFAULT_TITLE: &str = "New Chat";

/// Derive a session title from the first user message, truncated with
/// an ellipsis marker.
pub(crate) fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

pub struct SessionStore {
    /// Most-recent-first.
    sessions: Vec<Session>,
    current_id: Option<String>,
    storage: Arc<dyn KvStore>,
}

impl SessionStore {
    /// Load persisted sessions from storage. An unreadable record is
    /// logged and treated as empty.
    pub async fn load(storage: Arc<dyn KvStore>) -> Self {
        let sessions = match storage.get(keys::SESSIONS).await {
            Ok(Some(value)) => match serde_json::from_value::<Vec<Session>>(value) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("discarding unreadable session records: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("failed to read sessions: {e}");
                Vec::new()
            }
        };
        let current_id = sessions.first().map(|s| s.id.clone());
        Self {
            sessions,
            current_id,
            storage,
        }
    }

    /// Create a session with a fresh id, empty transcript, and no
    /// context. Does not switch to it; the caller decides.
    pub async fn create_session(&mut self, model: impl Into<String>) -> Session {
        let session = Session {
            id: new_id(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now_ms(),
            model: model.into(),
            messages: Vec::new(),
            context: None,
        };
        self.sessions.insert(0, session.clone());
        self.persist().await;
        session
    }

    /// Insert an already-built session at the front (pending-session
    /// promotion path).
    pub(crate) async fn insert_front(&mut self, session: Session) {
        self.sessions.insert(0, session);
        self.persist().await;
    }

    /// Make a session current, returning a copy of it.
    pub async fn switch_to(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.iter().find(|s| s.id == id)?.clone();
        self.current_id = Some(session.id.clone());
        self.persist().await;
        Some(session)
    }

    /// Delete a session. Returns `true` when the deleted session was the
    /// current one, in which case the current pointer has already moved
    /// to the most-recent remaining session (or cleared) and the caller
    /// should switch or create anew.
    pub async fn delete_session(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        if self.sessions.len() == before {
            return false;
        }

        let was_current = self.current_id.as_deref() == Some(id);
        if was_current {
            self.current_id = self.sessions.first().map(|s| s.id.clone());
        }
        self.persist().await;
        was_current
    }

    /// Append one completed exchange and update the carried context.
    /// The only mutator of `messages`/`context` after creation.
    pub async fn append_exchange(
        &mut self,
        session_id: &str,
        user_msg: Message,
        ai_msg: Message,
        context: Option<serde_json::Value>,
    ) -> bool {
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) else {
            warn!(session = session_id, "append to unknown session dropped");
            return false;
        };

        if session.messages.is_empty() && session.title == DEFAULT_TITLE {
            session.title = derive_title(&user_msg.text);
        }
        session.messages.push(user_msg);
        session.messages.push(ai_msg);
        if context.is_some() {
            session.context = context;
        }
        debug!(session = session_id, "exchange appended");
        self.persist().await;
        true
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// All sessions, most-recent-first.
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    async fn persist(&self) {
        if let Err(e) = self.flush().await {
            warn!("session persist failed, in-memory copy remains authoritative: {e}");
        }
    }

    /// Write the session list to durable storage.
    pub async fn flush(&self) -> Result<(), nexus_common::StorageError> {
        let value = serde_json::to_value(&self.sessions)
            .map_err(|e| nexus_common::StorageError::Serialize(e.to_string()))?;
        self.storage.set(keys::SESSIONS, value).await
    }
}
