//! Shared types for the Nexus assistant engine.
//!
//! Everything that crosses a crate or surface boundary lives here: the
//! error taxonomy, id generation, the conversation data model, and the
//! tagged request/notification enums carried over the message bus.

pub mod bus;
pub mod errors;
pub mod id;
pub mod types;

pub use bus::{Notification, Notifier, Request, Response};
pub use errors::{BackendError, EngineError, StorageError};
pub use id::{new_id, new_request_id};
pub use types::{
    Attachment, FilePayload, FilesPayload, GenerationResult, GenerationStatus, Message,
    PendingMessage, PendingPayload, PromptRequest, Role, Session, Surface, ToolDescriptor,
    ToolMode, ToolServerConfig, Transport,
};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Current wall-clock time as epoch milliseconds.
///
/// All persisted timestamps (session creation, pending-session expiry)
/// use this representation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
