//! Conversation session and prompt orchestration engine for Nexus.
//!
//! Provides the state-bearing core behind the assistant surfaces:
//! - Session store with durable persistence
//! - Single-slot pending-session buffer with lazy expiry
//! - Tool-server registry with fingerprinted tool caches
//! - Request orchestrator with streaming, cancellation, and a strict
//!   one-in-flight policy
//! - Provider routing over an abstract model backend

pub mod engine;
pub mod openai;
pub mod orchestrator;
pub mod pending;
pub mod router;
pub mod session;
pub mod storage;
pub mod streaming;
pub mod tools;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;

use nexus_common::{Attachment, BackendError, ToolDescriptor};

pub use engine::{Engine, ModelDefaults};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use orchestrator::{CancelOutcome, RequestOrchestrator};
pub use pending::PendingSessionBuffer;
pub use router::{BackendRouter, Provider};
pub use session::SessionStore;
pub use storage::{JsonFileStore, KvStore, MemoryStore};
pub use tools::ToolRegistry;

/// A cumulative partial result produced mid-generation.
///
/// `text` and `thoughts` carry everything produced so far, not a delta;
/// the streaming surfaces replace their display on every update.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub text: String,
    pub thoughts: Option<String>,
}

/// Callback invoked for every partial chunk of a streaming generation.
pub type ChunkFn = Box<dyn Fn(StreamChunk) + Send + Sync>;

/// One generation call handed to a backend.
pub struct BackendRequest {
    pub text: String,
    pub model: String,
    pub files: Vec<Attachment>,
    /// Explicit conversation context to continue from. `None` means the
    /// backend's implicit current context applies.
    pub context: Option<serde_json::Value>,
    pub tools: Vec<ToolDescriptor>,
    /// Cooperative cancellation signal. Backends check it between
    /// chunks and stop producing output once set.
    pub cancelled: Arc<AtomicBool>,
}

/// Successful completion of a backend call.
#[derive(Debug, Clone, Default)]
pub struct BackendReply {
    pub text: String,
    pub thoughts: Option<String>,
    pub generated_images: Option<Vec<String>>,
    /// Context blob to carry forward on the session, if the provider
    /// produced one.
    pub context: Option<serde_json::Value>,
}

/// Abstract model-provider capability.
///
/// Wire-level protocol lives behind this trait; the engine only relies
/// on streamed chunks, a terminal reply, and opaque context handling.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        request: BackendRequest,
        on_chunk: ChunkFn,
    ) -> Result<BackendReply, BackendError>;

    /// Forget the implicit current conversation context.
    async fn reset_context(&self) -> Result<(), BackendError>;

    /// Replace the implicit current context (e.g. when the user switches
    /// to a stored session).
    async fn set_context(&self, context: serde_json::Value) -> Result<(), BackendError>;

    /// Release any provider-side state tied to a stored context. Called
    /// when the owning session is deleted.
    async fn clear_context(&self, context: &serde_json::Value) -> Result<(), BackendError>;
}

/// Receiver for streaming updates, registered by the originating
/// surface. Delivery is fire-and-forget: a `false` return means the
/// surface is gone, which never aborts the backend call.
pub trait UpdateSink: Send + Sync {
    fn deliver(&self, chunk: StreamChunk) -> bool;
}
