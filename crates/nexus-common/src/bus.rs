//! Message-bus vocabulary.
//!
//! Surfaces talk to the engine through a tagged [`Request`] enum matched
//! exhaustively, so a new request kind is a compile-time-checked
//! addition. Outbound [`Notification`]s ride an unreliable at-most-once
//! broadcast channel: delivery failures are swallowed, and callers must
//! not depend on delivery for correctness (UI refresh only).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{
    GenerationResult, PendingPayload, PromptRequest, Session, ToolDescriptor, Transport,
};

/// Every request a surface can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Request {
    SubmitPrompt(PromptRequest),
    CancelRequest,
    StagePendingSession(PendingPayload),
    PromotePendingSession,
    /// A fresh tool list fetched for a server by the transport layer.
    SupplyToolList {
        server_id: String,
        transport: Transport,
        url: String,
        tools: Vec<ToolDescriptor>,
    },
    ListTools,
    NewSession {
        model: Option<String>,
    },
    SwitchSession {
        id: String,
    },
    DeleteSession {
        id: String,
    },
    ListSessions,
    SetContext {
        context: serde_json::Value,
        model: Option<String>,
    },
    ResetContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    Generation {
        result: GenerationResult,
        session_id: Option<String>,
        staged_pending: bool,
    },
    Cancelled {
        cancelled: bool,
    },
    /// Staged, not promoted.
    Staged,
    Promoted {
        session_id: Option<String>,
    },
    Tools(Vec<ToolDescriptor>),
    Session(Session),
    Sessions(Vec<Session>),
    Deleted {
        needs_switch: bool,
    },
    Error {
        message: String,
    },
    Ack,
}

/// Fire-and-forget notifications pushed toward whichever surfaces are
/// still listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    StreamUpdate {
        text: String,
        thoughts: Option<String>,
    },
    StreamDone {
        result: GenerationResult,
        pending_session: Option<PendingPayload>,
    },
    SessionsChanged {
        sessions: Vec<Session>,
    },
}

/// Broadcast channel for [`Notification`]s.
///
/// A publish with no live subscribers is not an error; the count of
/// receivers that got the message is returned for logging only.
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notification: Notification) -> usize {
        self.sender.send(notification).unwrap_or(0)
    }
}
