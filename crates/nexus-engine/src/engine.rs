//! Engine facade: one owner for all orchestration state.
//!
//! Every component (session store, tool registry, pending buffer,
//! orchestrator, router, storage handle, notifier) lives inside the
//! `Engine` — there are no ambient globals. Surfaces drive it through
//! [`Engine::handle`], an exhaustive match over the tagged request enum,
//! and observe it through the broadcast notification channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use nexus_common::{
    Notification, Notifier, PendingPayload, Request, Response, Session, Surface,
};

use crate::orchestrator::{CancelOutcome, RequestOrchestrator};
use crate::pending::PendingSessionBuffer;
use crate::router::BackendRouter;
use crate::session::SessionStore;
use crate::storage::{keys, KvStore};
use crate::tools::ToolRegistry;
use crate::{StreamChunk, UpdateSink};

/// Per-surface model fallbacks, applied when a request names no model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefaults {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "quick_ask_model")]
    pub quick_ask_model: String,
}

fn default_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn quick_ask_model() -> String {
    "gemini-2.5-flash".to_string()
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            quick_ask_model: quick_ask_model(),
        }
    }
}

impl ModelDefaults {
    pub fn model_for(&self, surface: Surface) -> &str {
        match surface {
            Surface::SidePanel => &self.default_model,
            Surface::QuickAsk | Surface::PageAction => &self.quick_ask_model,
        }
    }
}

/// Streams partial updates onto the notification channel.
struct NotificationSink(Arc<Notifier>);

impl UpdateSink for NotificationSink {
    fn deliver(&self, chunk: StreamChunk) -> bool {
        self.0.publish(Notification::StreamUpdate {
            text: chunk.text,
            thoughts: chunk.thoughts,
        }) > 0
    }
}

pub struct Engine {
    storage: Arc<dyn KvStore>,
    store: Arc<Mutex<SessionStore>>,
    registry: Arc<Mutex<ToolRegistry>>,
    pending: Arc<Mutex<PendingSessionBuffer>>,
    router: Arc<BackendRouter>,
    orchestrator: Arc<RequestOrchestrator>,
    notifier: Arc<Notifier>,
    defaults: ModelDefaults,
}

impl Engine {
    /// Load persisted state and assemble the engine. An expired pending
    /// marker is discarded during load rather than resurfacing.
    pub async fn init(storage: Arc<dyn KvStore>, router: BackendRouter) -> Self {
        let defaults = match storage.get(keys::MODEL_DEFAULTS).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            _ => ModelDefaults::default(),
        };

        let store = Arc::new(Mutex::new(SessionStore::load(Arc::clone(&storage)).await));
        let registry = Arc::new(Mutex::new(ToolRegistry::load(Arc::clone(&storage)).await));

        let mut pending = PendingSessionBuffer::new();
        if let (Ok(Some(payload)), Ok(Some(expires))) = (
            storage.get(keys::PENDING_SESSION).await,
            storage.get(keys::PENDING_EXPIRES_AT).await,
        ) {
            match (
                serde_json::from_value::<PendingPayload>(payload),
                expires.as_i64(),
            ) {
                (Ok(payload), Some(expires_at)) => pending.restore(payload, expires_at),
                _ => warn!("discarding unreadable pending-session marker"),
            }
        }
        let pending = Arc::new(Mutex::new(pending));

        let router = Arc::new(router);
        let notifier = Arc::new(Notifier::new(32));
        let orchestrator = Arc::new(RequestOrchestrator::new(
            Arc::clone(&router),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&pending),
            defaults.clone(),
        ));
        orchestrator.set_sink(Arc::new(NotificationSink(Arc::clone(&notifier))));

        info!("engine initialized");
        Self {
            storage,
            store,
            registry,
            pending,
            router,
            orchestrator,
            notifier,
            defaults,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    /// Dispatch one bus request.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SubmitPrompt(prompt) => match self.orchestrator.submit(prompt).await {
                Ok(outcome) => {
                    if outcome.staged_pending.is_some() {
                        self.persist_pending_marker().await;
                    }
                    self.notifier.publish(Notification::StreamDone {
                        result: outcome.result.clone(),
                        pending_session: outcome.staged_pending.clone(),
                    });
                    if outcome.session_id.is_some() {
                        self.notify_sessions().await;
                    }
                    Response::Generation {
                        result: outcome.result,
                        session_id: outcome.session_id,
                        staged_pending: outcome.staged_pending.is_some(),
                    }
                }
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },

            Request::CancelRequest => Response::Cancelled {
                cancelled: self.orchestrator.cancel() == CancelOutcome::Cancelled,
            },

            Request::StagePendingSession(payload) => {
                self.pending.lock().await.stage(payload);
                self.persist_pending_marker().await;
                Response::Staged
            }

            Request::PromotePendingSession => {
                let session_id = {
                    let mut store = self.store.lock().await;
                    let mut pending = self.pending.lock().await;
                    pending
                        .promote(&mut store, &self.defaults.default_model)
                        .await
                };
                self.clear_pending_marker().await;
                if session_id.is_some() {
                    self.notify_sessions().await;
                }
                Response::Promoted { session_id }
            }

            Request::SupplyToolList {
                server_id,
                transport,
                url,
                tools,
            } => {
                self.registry
                    .lock()
                    .await
                    .set_tool_list(&server_id, transport, &url, tools.clone());
                Response::Tools(tools)
            }

            Request::ListTools => {
                Response::Tools(self.registry.lock().await.effective_tool_set())
            }

            Request::NewSession { model } => {
                let model = model.unwrap_or_else(|| self.defaults.default_model.clone());
                let session = self.store.lock().await.create_session(model).await;
                self.notify_sessions().await;
                Response::Session(session)
            }

            Request::SwitchSession { id } => {
                let session = self.store.lock().await.switch_to(&id).await;
                match session {
                    Some(session) => {
                        // Point the backend's implicit context at this
                        // conversation so follow-ups continue it.
                        self.apply_context(session.context.clone()).await;
                        Response::Session(session)
                    }
                    None => Response::Error {
                        message: nexus_common::EngineError::UnknownSession(id).to_string(),
                    },
                }
            }

            Request::DeleteSession { id } => {
                let context = {
                    let store = self.store.lock().await;
                    store.get(&id).and_then(|s| s.context.clone())
                };
                let needs_switch = self.store.lock().await.delete_session(&id).await;
                if let Some(context) = context {
                    if let Ok(backend) = self.router.resolve(None) {
                        if let Err(e) = backend.clear_context(&context).await {
                            warn!("failed to clear backend context for deleted session: {e}");
                        }
                    }
                }
                self.notify_sessions().await;
                Response::Deleted { needs_switch }
            }

            Request::ListSessions => {
                Response::Sessions(self.store.lock().await.sessions().to_vec())
            }

            Request::SetContext { context, .. } => {
                match self.router.resolve(None) {
                    Ok(backend) => match backend.set_context(context).await {
                        Ok(()) => Response::Ack,
                        Err(e) => Response::Error {
                            message: e.to_string(),
                        },
                    },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }

            Request::ResetContext => match self.router.resolve(None) {
                Ok(backend) => match backend.reset_context().await {
                    Ok(()) => Response::Ack,
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
        }
    }

    /// Flush all durable state. Called on shutdown.
    pub async fn teardown(&self) {
        if let Err(e) = self.store.lock().await.flush().await {
            warn!("session flush failed on teardown: {e}");
        }
        if let Err(e) = self.registry.lock().await.flush().await {
            warn!("tool-server flush failed on teardown: {e}");
        }
        self.persist_pending_marker().await;
        info!("engine teardown complete");
    }

    async fn apply_context(&self, context: Option<serde_json::Value>) {
        let Ok(backend) = self.router.resolve(None) else {
            return;
        };
        let result = match context {
            Some(context) => backend.set_context(context).await,
            None => backend.reset_context().await,
        };
        if let Err(e) = result {
            warn!("failed to apply session context: {e}");
        }
    }

    async fn notify_sessions(&self) {
        let sessions: Vec<Session> = self.store.lock().await.sessions().to_vec();
        self.notifier
            .publish(Notification::SessionsChanged { sessions });
    }

    async fn persist_pending_marker(&self) {
        let pending = self.pending.lock().await;
        let Some(expires_at) = pending.expires_at() else {
            drop(pending);
            self.clear_pending_marker().await;
            return;
        };
        let Some(payload) = pending.payload() else {
            return;
        };
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("pending marker serialization failed: {e}");
                return;
            }
        };
        drop(pending);
        if let Err(e) = self.storage.set(keys::PENDING_SESSION, value).await {
            warn!("pending marker persist failed: {e}");
        }
        if let Err(e) = self
            .storage
            .set(keys::PENDING_EXPIRES_AT, serde_json::json!(expires_at))
            .await
        {
            warn!("pending expiry persist failed: {e}");
        }
    }

    async fn clear_pending_marker(&self) {
        if let Err(e) = self.storage.remove(keys::PENDING_SESSION).await {
            warn!("pending marker removal failed: {e}");
        }
        if let Err(e) = self.storage.remove(keys::PENDING_EXPIRES_AT).await {
            warn!("pending expiry removal failed: {e}");
        }
    }
}
