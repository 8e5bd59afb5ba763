//! Request orchestration: one in-flight generation, streamed partials,
//! cooperative cancellation, and completion routing.
//!
//! The orchestrator is the only component that talks to a model backend
//! and the only writer of session state, which is what lets the store
//! skip its own locking. A second `submit` while one is outstanding is
//! rejected outright; the active call is never disturbed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use nexus_common::{
    new_request_id, EngineError, FilePayload, FilesPayload, GenerationResult, GenerationStatus,
    Message, PendingPayload, PromptRequest, Role, Surface,
};

use crate::engine::ModelDefaults;
use crate::pending::PendingSessionBuffer;
use crate::router::BackendRouter;
use crate::session::SessionStore;
use crate::tools::ToolRegistry;
use crate::{BackendRequest, ChunkFn, StreamChunk, UpdateSink};

/// Outcome of a `cancel` call. Cancelling with nothing active is a
/// distinguishable no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NoActiveRequest,
}

/// What `submit` hands back: the terminal result plus where it went.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub result: GenerationResult,
    pub session_id: Option<String>,
    /// The payload staged into the pending buffer, when the origin
    /// defers persistence.
    pub staged_pending: Option<PendingPayload>,
}

/// Guard that clears the `busy` flag on drop, ensuring it is always
/// released even if the future is cancelled or an early return occurs.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    /// Attempt to acquire the busy lock. Returns `Err` if already busy.
    fn acquire(flag: &'a AtomicBool) -> Result<Self, EngineError> {
        if flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(EngineError::Busy);
        }
        Ok(Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The single in-flight request, while one exists.
struct ActiveRequest {
    request_id: String,
    cancelled: Arc<AtomicBool>,
}

pub struct RequestOrchestrator {
    router: Arc<BackendRouter>,
    store: Arc<Mutex<SessionStore>>,
    registry: Arc<Mutex<ToolRegistry>>,
    pending: Arc<Mutex<PendingSessionBuffer>>,
    defaults: ModelDefaults,
    /// Whether a request is currently in flight.
    busy: AtomicBool,
    active: StdMutex<Option<ActiveRequest>>,
    sink: RwLock<Option<Arc<dyn UpdateSink>>>,
}

impl RequestOrchestrator {
    pub fn new(
        router: Arc<BackendRouter>,
        store: Arc<Mutex<SessionStore>>,
        registry: Arc<Mutex<ToolRegistry>>,
        pending: Arc<Mutex<PendingSessionBuffer>>,
        defaults: ModelDefaults,
    ) -> Self {
        Self {
            router,
            store,
            registry,
            pending,
            defaults,
            busy: AtomicBool::new(false),
            active: StdMutex::new(None),
            sink: RwLock::new(None),
        }
    }

    /// Register the sink streaming updates go to. Replaces any prior
    /// sink (one originating surface at a time).
    pub fn set_sink(&self, sink: Arc<dyn UpdateSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub fn clear_sink(&self) {
        *self.sink.write().unwrap() = None;
    }

    /// Run one prompt request end to end.
    ///
    /// The only `Err` this returns is [`EngineError::Busy`] when another
    /// request is outstanding. Backend and configuration failures come
    /// back as `Ok` outcomes with `status: Error` — nothing propagates
    /// past this boundary.
    pub async fn submit(&self, request: PromptRequest) -> Result<GenerationOutcome, EngineError> {
        let _guard = BusyGuard::acquire(&self.busy)?;

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.defaults.model_for(request.origin).to_string());

        let backend = match self.router.resolve(None) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("no backend available: {e}");
                return Ok(self.error_outcome(&request, e.to_string()));
            }
        };

        // Resolve the conversation context this call continues from.
        let context = if let Some(session_id) = &request.session_id {
            let store = self.store.lock().await;
            match store.get(session_id) {
                Some(session) => session.context.clone(),
                None => {
                    warn!(session = %session_id, "submit against unknown session");
                    let err = EngineError::UnknownSession(session_id.clone());
                    return Ok(self.error_outcome(&request, err.to_string()));
                }
            }
        } else {
            if !request.preserve_context {
                // A fresh conversation must never leak the previous one.
                if let Err(e) = backend.reset_context().await {
                    warn!("context reset failed: {e}");
                    return Ok(self.error_outcome(&request, format!("context reset failed: {e}")));
                }
            }
            None
        };

        let tools = self.registry.lock().await.effective_tool_set();

        let cancelled = Arc::new(AtomicBool::new(false));
        let request_id = new_request_id();
        *self.active.lock().unwrap() = Some(ActiveRequest {
            request_id: request_id.clone(),
            cancelled: Arc::clone(&cancelled),
        });

        // Latest partial, for deterministic finalization after a cancel.
        let partial: Arc<StdMutex<StreamChunk>> = Arc::new(StdMutex::new(StreamChunk {
            text: String::new(),
            thoughts: None,
        }));
        let sink = self.sink.read().unwrap().clone();
        let on_chunk: ChunkFn = {
            let cancelled = Arc::clone(&cancelled);
            let partial = Arc::clone(&partial);
            Box::new(move |chunk: StreamChunk| {
                // No updates past an acknowledged cancellation.
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                *partial.lock().unwrap() = chunk.clone();
                if let Some(sink) = &sink {
                    // Fire-and-forget: a gone surface never aborts the call.
                    if !sink.deliver(chunk) {
                        debug!("update sink gone, continuing generation");
                    }
                }
            })
        };

        debug!(request = %request_id, model = %model, tools = tools.len(), "dispatching prompt");

        let call = backend
            .generate(
                BackendRequest {
                    text: request.text.clone(),
                    model: model.clone(),
                    files: request.files.clone(),
                    context,
                    tools,
                    cancelled: Arc::clone(&cancelled),
                },
                on_chunk,
            )
            .await;

        *self.active.lock().unwrap() = None;

        // Finalize deterministically: a cancelled call always yields a
        // cancelled result carrying the last partial state, whatever the
        // backend returned.
        let (result, new_context) = if cancelled.load(Ordering::Acquire) {
            let last = partial.lock().unwrap().clone();
            debug!(request = %request_id, "request cancelled");
            (
                GenerationResult {
                    status: GenerationStatus::Cancelled,
                    text: last.text,
                    thoughts: last.thoughts,
                    generated_images: None,
                },
                None,
            )
        } else {
            match call {
                Ok(reply) => (
                    GenerationResult {
                        status: GenerationStatus::Success,
                        text: reply.text,
                        thoughts: reply.thoughts,
                        generated_images: reply.generated_images,
                    },
                    reply.context,
                ),
                Err(e) => {
                    warn!(request = %request_id, "backend call failed: {e}");
                    (GenerationResult::error(e.to_string()), None)
                }
            }
        };

        self.route_completion(request, model, result, new_context)
            .await
    }

    /// Hand the finished result to its persistence path: immediate
    /// append for session-bound side-panel requests, deferred staging
    /// for quick-ask surfaces. Only successful results are persisted.
    async fn route_completion(
        &self,
        request: PromptRequest,
        model: String,
        result: GenerationResult,
        new_context: Option<serde_json::Value>,
    ) -> Result<GenerationOutcome, EngineError> {
        match (request.origin, &request.session_id) {
            (Surface::SidePanel, Some(session_id)) => {
                if result.status == GenerationStatus::Success {
                    let user_msg = Message {
                        role: Role::User,
                        text: request.text.clone(),
                        attachments: if request.files.is_empty() {
                            None
                        } else {
                            Some(request.files.clone())
                        },
                        thoughts: None,
                    };
                    let ai_msg = Message {
                        role: Role::Assistant,
                        text: result.text.clone(),
                        attachments: result.generated_images.clone().map(|images| {
                            images
                                .into_iter()
                                .map(|data| nexus_common::Attachment::new(data, "image/png"))
                                .collect()
                        }),
                        thoughts: result.thoughts.clone(),
                    };
                    self.store
                        .lock()
                        .await
                        .append_exchange(session_id, user_msg, ai_msg, new_context)
                        .await;
                }
                Ok(GenerationOutcome {
                    result,
                    session_id: Some(session_id.clone()),
                    staged_pending: None,
                })
            }
            _ => {
                let staged_pending = if result.status == GenerationStatus::Success {
                    let files = if request.files.is_empty() {
                        None
                    } else {
                        Some(FilesPayload::Many(
                            request
                                .files
                                .iter()
                                .map(|a| FilePayload::Object {
                                    base64: a.data.clone(),
                                    media_type: Some(a.media_type.clone()),
                                    name: None,
                                })
                                .collect(),
                        ))
                    };
                    let payload = PendingPayload {
                        text: Some(request.text.clone()),
                        result: Some(result.clone()),
                        files,
                        messages: None,
                        context: new_context,
                        model: Some(model),
                    };
                    self.pending.lock().await.stage(payload.clone());
                    Some(payload)
                } else {
                    None
                };
                Ok(GenerationOutcome {
                    result,
                    session_id: request.session_id,
                    staged_pending,
                })
            }
        }
    }

    fn error_outcome(&self, request: &PromptRequest, message: String) -> GenerationOutcome {
        GenerationOutcome {
            result: GenerationResult::error(message),
            session_id: request.session_id.clone(),
            staged_pending: None,
        }
    }

    /// Signal the active request to stop. Safe to call at any time;
    /// with nothing active it mutates no state.
    pub fn cancel(&self) -> CancelOutcome {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(req) => {
                req.cancelled.store(true, Ordering::Release);
                debug!(request = %req.request_id, "cancellation signalled");
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::NoActiveRequest,
        }
    }

    /// Whether a request is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}
