//! Single-slot buffer for a not-yet-persisted quick-ask exchange.
//!
//! The slot holds at most one staged payload with a fixed time-to-live.
//! Expiry is an owned timestamp checked lazily on every access; there is
//! no background timer, so expiry can never race a concurrent promote.
//! A staged payload becomes a real `Session` only through [`promote`],
//! on explicit user confirmation.
//!
//! [`promote`]: PendingSessionBuffer::promote

use tracing::{debug, warn};

use nexus_common::{new_id, now_ms, Message, PendingPayload, Role, Session};

use crate::session::{derive_title, SessionStore};

/// Default time-to-live for a staged payload: 5 minutes.
pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;

const FALLBACK_TITLE: &str = "Quick Ask";

struct Staged {
    payload: PendingPayload,
    expires_at: i64,
}

pub struct PendingSessionBuffer {
    slot: Option<Staged>,
    ttl_ms: i64,
}

impl Default for PendingSessionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingSessionBuffer {
    pub fn new() -> Self {
        Self {
            slot: None,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Stage a payload, overwriting any previous one and re-arming the
    /// expiry deadline. Returns the deadline (epoch ms).
    pub fn stage(&mut self, payload: PendingPayload) -> i64 {
        let expires_at = now_ms() + self.ttl_ms;
        self.slot = Some(Staged {
            payload,
            expires_at,
        });
        debug!(expires_at, "pending session staged");
        expires_at
    }

    /// Re-install a payload loaded from durable storage, keeping its
    /// original deadline. An already-expired payload is discarded.
    pub fn restore(&mut self, payload: PendingPayload, expires_at: i64) {
        if now_ms() >= expires_at {
            debug!("persisted pending session already expired, discarding");
            return;
        }
        self.slot = Some(Staged {
            payload,
            expires_at,
        });
    }

    /// Whether a live (non-expired) payload is staged. Purges an
    /// expired one as a side effect.
    pub fn is_staged(&mut self) -> bool {
        self.purge_expired();
        self.slot.is_some()
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.slot.as_ref().map(|s| s.expires_at)
    }

    pub fn payload(&self) -> Option<&PendingPayload> {
        self.slot.as_ref().map(|s| &s.payload)
    }

    fn purge_expired(&mut self) {
        if let Some(staged) = &self.slot {
            if now_ms() >= staged.expires_at {
                debug!("pending session expired, discarding");
                self.slot = None;
            }
        }
    }

    /// Materialize the staged payload into a persisted session.
    ///
    /// Callable once per staged payload: the slot is consumed. With
    /// nothing staged, or after expiry, returns `None` without side
    /// effects. A malformed payload (no turns at all) is logged and
    /// dropped, also yielding `None`.
    pub async fn promote(
        &mut self,
        store: &mut SessionStore,
        default_model: &str,
    ) -> Option<String> {
        self.purge_expired();
        let staged = self.slot.take()?;
        let payload = staged.payload;

        let messages = match build_messages(&payload) {
            Some(messages) => messages,
            None => {
                warn!("pending session payload has no usable turns, dropping");
                return None;
            }
        };

        let title = messages
            .iter()
            .find(|m| m.role == Role::User && !m.text.trim().is_empty())
            .map(|m| derive_title(&m.text))
            .unwrap_or_else(|| FALLBACK_TITLE.to_string());

        let session = Session {
            id: new_id(),
            title,
            created_at: now_ms(),
            model: payload
                .model
                .unwrap_or_else(|| default_model.to_string()),
            messages,
            context: payload.context,
        };
        let id = session.id.clone();
        store.insert_front(session).await;
        debug!(session = %id, "pending session promoted");
        Some(id)
    }
}

/// Transform either payload shape into the store's message list.
fn build_messages(payload: &PendingPayload) -> Option<Vec<Message>> {
    // Multi-turn shape wins when present.
    if let Some(turns) = &payload.messages {
        if !turns.is_empty() {
            let messages = turns
                .iter()
                .map(|turn| {
                    let attachments = match turn.role {
                        Role::User => turn
                            .files
                            .clone()
                            .map(|files| files.into_attachments())
                            .filter(|a| !a.is_empty()),
                        Role::Assistant => turn.images.clone().map(|images| {
                            images
                                .into_iter()
                                .map(|data| nexus_common::Attachment::new(data, "image/png"))
                                .collect()
                        }),
                    };
                    Message {
                        role: turn.role,
                        text: turn.text.clone(),
                        attachments,
                        thoughts: turn.thoughts.clone(),
                    }
                })
                .collect();
            return Some(messages);
        }
    }

    // Legacy single exchange.
    let text = payload.text.as_ref()?;
    let result = payload.result.as_ref()?;

    let mut user = Message::user(text.clone());
    user.attachments = payload
        .files
        .clone()
        .map(|files| files.into_attachments())
        .filter(|a| !a.is_empty());

    let mut ai = Message::assistant(result.text.clone());
    ai.thoughts = result.thoughts.clone();
    ai.attachments = result.generated_images.clone().map(|images| {
        images
            .into_iter()
            .map(|data| nexus_common::Attachment::new(data, "image/png"))
            .collect()
    });

    Some(vec![user, ai])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nexus_common::{FilePayload, FilesPayload, GenerationResult, GenerationStatus, PendingMessage};

    use crate::storage::MemoryStore;

    async fn empty_store() -> SessionStore {
        SessionStore::load(Arc::new(MemoryStore::new())).await
    }

    fn legacy_payload(text: &str, answer: &str) -> PendingPayload {
        PendingPayload {
            text: Some(text.into()),
            result: Some(GenerationResult {
                status: GenerationStatus::Success,
                text: answer.into(),
                thoughts: None,
                generated_images: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn promote_legacy_exchange() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;

        buffer.stage(legacy_payload("what is rust", "a language"));
        let id = buffer.promote(&mut store, "default-model").await.unwrap();

        let session = store.get(&id).unwrap();
        assert_eq!(session.title, "what is rust");
        assert_eq!(session.model, "default-model");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].text, "what is rust");
        assert_eq!(session.messages[1].text, "a language");
    }

    #[tokio::test]
    async fn promote_twice_returns_none() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;

        buffer.stage(legacy_payload("q", "a"));
        assert!(buffer.promote(&mut store, "m").await.is_some());
        assert!(buffer.promote(&mut store, "m").await.is_none());
        assert_eq!(store.sessions().len(), 1);
    }

    #[tokio::test]
    async fn promote_after_expiry_returns_none() {
        let mut buffer = PendingSessionBuffer::new().with_ttl_ms(0);
        let mut store = empty_store().await;

        buffer.stage(legacy_payload("q", "a"));
        assert!(buffer.promote(&mut store, "m").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn promote_with_nothing_staged_returns_none() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;
        assert!(buffer.promote(&mut store, "m").await.is_none());
    }

    #[tokio::test]
    async fn stage_overwrites_previous_payload() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;

        buffer.stage(legacy_payload("first", "a"));
        buffer.stage(legacy_payload("second", "b"));

        let id = buffer.promote(&mut store, "m").await.unwrap();
        assert_eq!(store.get(&id).unwrap().messages[0].text, "second");
        assert_eq!(store.sessions().len(), 1);
    }

    #[tokio::test]
    async fn promote_multi_turn_with_attachment() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;

        let payload = PendingPayload {
            messages: Some(vec![
                PendingMessage {
                    role: Role::User,
                    text: "what is in this image".into(),
                    files: Some(FilesPayload::One(FilePayload::Object {
                        base64: "aW1hZ2U=".into(),
                        media_type: Some("image/jpeg".into()),
                        name: None,
                    })),
                    thoughts: None,
                    images: None,
                },
                PendingMessage {
                    role: Role::Assistant,
                    text: "a crab".into(),
                    files: None,
                    thoughts: Some("looks crustacean".into()),
                    images: None,
                },
            ]),
            context: Some(serde_json::json!({ "handle": "abc" })),
            ..Default::default()
        };

        buffer.stage(payload);
        let id = buffer.promote(&mut store, "m").await.unwrap();

        let session = store.get(&id).unwrap();
        assert_eq!(session.title, "what is in this image");
        assert_eq!(session.context, Some(serde_json::json!({ "handle": "abc" })));
        let attachment = &session.messages[0].attachments.as_ref().unwrap()[0];
        assert_eq!(attachment.data, "aW1hZ2U=");
        assert_eq!(attachment.media_type, "image/jpeg");
        assert_eq!(session.messages[1].thoughts.as_deref(), Some("looks crustacean"));
    }

    #[tokio::test]
    async fn promoted_attachment_survives_append_and_reload() {
        let storage: Arc<dyn crate::storage::KvStore> = Arc::new(MemoryStore::new());
        let mut store = SessionStore::load(Arc::clone(&storage)).await;
        let mut buffer = PendingSessionBuffer::new();

        let payload = PendingPayload {
            messages: Some(vec![
                PendingMessage {
                    role: Role::User,
                    text: "what is this".into(),
                    files: Some(FilesPayload::One(FilePayload::Object {
                        base64: "/9j/4AAQSkZJRg==".into(),
                        media_type: Some("image/jpeg".into()),
                        name: Some("photo.jpg".into()),
                    })),
                    thoughts: None,
                    images: None,
                },
                PendingMessage {
                    role: Role::Assistant,
                    text: "a harbor at dusk".into(),
                    files: None,
                    thoughts: None,
                    images: None,
                },
            ]),
            ..Default::default()
        };
        buffer.stage(payload);
        let id = buffer.promote(&mut store, "m").await.unwrap();

        store
            .append_exchange(
                &id,
                Message::user("and the season?"),
                Message::assistant("late autumn"),
                None,
            )
            .await;

        // A fresh store over the same backing storage sees the full
        // transcript with the attachment bytes untouched.
        let reloaded = SessionStore::load(storage).await;
        let session = reloaded.get(&id).unwrap();
        assert_eq!(session.messages.len(), 4);
        let attachment = &session.messages[0].attachments.as_ref().unwrap()[0];
        assert_eq!(attachment.data, "/9j/4AAQSkZJRg==");
        assert_eq!(attachment.media_type, "image/jpeg");
        assert_eq!(session.messages[2].text, "and the season?");
        assert_eq!(session.messages[3].text, "late autumn");
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;

        buffer.stage(PendingPayload::default());
        assert!(buffer.promote(&mut store, "m").await.is_none());
        assert!(store.is_empty());
        // Slot is consumed either way.
        assert!(!buffer.is_staged());
    }

    #[tokio::test]
    async fn restore_discards_expired_marker() {
        let mut buffer = PendingSessionBuffer::new();
        buffer.restore(legacy_payload("q", "a"), now_ms() - 1);
        assert!(!buffer.is_staged());

        buffer.restore(legacy_payload("q", "a"), now_ms() + 60_000);
        assert!(buffer.is_staged());
    }

    #[tokio::test]
    async fn long_first_message_is_truncated_in_title() {
        let mut buffer = PendingSessionBuffer::new();
        let mut store = empty_store().await;

        let long = "explain the borrow checker in excruciating detail".to_string();
        buffer.stage(legacy_payload(&long, "ok"));
        let id = buffer.promote(&mut store, "m").await.unwrap();

        let title = &store.get(&id).unwrap().title;
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), 33);
    }
}
