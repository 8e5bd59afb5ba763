//! Conversation data model shared by the engine and its surfaces.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    // Legacy records spell the assistant role "ai".
    #[serde(alias = "ai")]
    Assistant,
}

/// Binary attachment content (image), immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Base64-encoded payload.
    pub data: String,
    /// Media type tag, e.g. `image/png`.
    pub media_type: String,
}

impl Attachment {
    pub fn new(data: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            media_type: media_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    /// Intermediate reasoning surfaced by some models. Display-only:
    /// never replayed into a subsequent request as history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            attachments: None,
            thoughts: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            attachments: None,
            thoughts: None,
        }
    }
}

/// A persisted, named conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub model: String,
    pub messages: Vec<Message>,
    /// Provider-opaque state required to continue the conversation.
    /// Travels with every subsequent request on this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Which entry surface originated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    SidePanel,
    QuickAsk,
    PageAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Sse,
    StreamableHttp,
    #[serde(alias = "ws")]
    Websocket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Sse => "sse",
            Transport::StreamableHttp => "streamable-http",
            Transport::Websocket => "websocket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    All,
    Selected,
}

/// Configuration for one external tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub id: String,
    pub name: String,
    pub transport: Transport,
    pub url: String,
    pub enabled: bool,
    pub tool_mode: ToolMode,
    /// Only consulted when `tool_mode` is `Selected`. Preserved across a
    /// switch back to `All` for later re-selection.
    #[serde(default)]
    pub enabled_tools: BTreeSet<String>,
}

/// One tool advertised by a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}

/// A prompt submitted by an entry surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub text: String,
    /// Explicit model override; otherwise the surface's configured
    /// default applies.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub files: Vec<Attachment>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// When no session is bound: `false` resets the backend context
    /// before sending, `true` keeps accumulating on the implicit one.
    #[serde(default)]
    pub preserve_context: bool,
    pub origin: Surface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Error,
    Cancelled,
}

/// Terminal outcome of one generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub status: GenerationStatus,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_images: Option<Vec<String>>,
}

impl GenerationResult {
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            status: GenerationStatus::Error,
            text: text.into(),
            thoughts: None,
            generated_images: None,
        }
    }
}

/// File field of a staged pending payload. Older surfaces send a single
/// object, newer ones an array, and the oldest records are bare base64
/// strings; all three deserialize transparently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilesPayload {
    Many(Vec<FilePayload>),
    One(FilePayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilePayload {
    Raw(String),
    Object {
        base64: String,
        #[serde(rename = "type", default)]
        media_type: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl FilePayload {
    fn into_attachment(self) -> Attachment {
        match self {
            FilePayload::Raw(base64) => Attachment::new(base64, "image/png"),
            FilePayload::Object {
                base64, media_type, ..
            } => Attachment::new(base64, media_type.unwrap_or_else(|| "image/png".into())),
        }
    }
}

impl FilesPayload {
    /// Normalize the single-or-array shapes into a uniform list.
    pub fn into_attachments(self) -> Vec<Attachment> {
        match self {
            FilesPayload::Many(files) => files.into_iter().map(FilePayload::into_attachment).collect(),
            FilesPayload::One(file) => vec![file.into_attachment()],
        }
    }
}

/// One turn of a multi-turn pending payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub files: Option<FilesPayload>,
    #[serde(default)]
    pub thoughts: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

/// A not-yet-persisted exchange awaiting explicit confirmation.
///
/// Two shapes are accepted: the legacy single exchange (`text` +
/// `result` + `files`) and the multi-turn form (`messages`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub result: Option<GenerationResult>,
    #[serde(default)]
    pub files: Option<FilesPayload>,
    #[serde(default)]
    pub messages: Option<Vec<PendingMessage>>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub model: Option<String>,
}
