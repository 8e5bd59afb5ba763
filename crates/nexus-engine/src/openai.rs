//! OpenAI-compatible streaming backend.
//!
//! Talks to any `chat.completions`-shaped endpoint (configurable base
//! URL). This provider keeps no server-side conversation state: the
//! opaque context blob is the serialized prior-message history, replayed
//! on every call.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::debug;

use nexus_common::{Attachment, BackendError, ToolDescriptor};

use crate::streaming::SseParser;
use crate::{BackendReply, BackendRequest, ChunkFn, ModelBackend, StreamChunk};

/// OpenAI-compatible endpoint configuration.
#[derive(Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

pub struct OpenAiBackend {
    config: OpenAiConfig,
    http: reqwest::Client,
    /// Implicit conversation context, used when a request carries none.
    current_context: Mutex<Option<serde_json::Value>>,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            config,
            http,
            current_context: Mutex::new(None),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Prior turns carried in a context blob (`{"messages": [...]}`).
fn history_from_context(context: Option<&serde_json::Value>) -> Vec<serde_json::Value> {
    context
        .and_then(|c| c.get("messages"))
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default()
}

/// The user-turn content for one request: plain text, or text plus
/// data-URL image parts when attachments ride along.
fn user_content(text: &str, files: &[Attachment]) -> serde_json::Value {
    if files.is_empty() {
        return serde_json::json!(text);
    }
    let mut parts = vec![serde_json::json!({ "type": "text", "text": text })];
    for file in files {
        parts.push(serde_json::json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{}", file.media_type, file.data) }
        }));
    }
    serde_json::Value::Array(parts)
}

fn tool_definitions(tools: &[ToolDescriptor]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|tool| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": tool
                        .input_schema
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
                }
            })
        })
        .collect()
}

/// Build the streaming request body for one call.
fn build_request_body(
    config: &OpenAiConfig,
    request: &BackendRequest,
    history: &[serde_json::Value],
) -> serde_json::Value {
    let mut messages = history.to_vec();
    messages.push(serde_json::json!({
        "role": "user",
        "content": user_content(&request.text, &request.files),
    }));

    let model = if request.model.is_empty() {
        config.model.clone()
    } else {
        request.model.clone()
    };

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": config.max_tokens,
        "messages": messages,
        "stream": true,
    });
    if !request.tools.is_empty() {
        body["tools"] = serde_json::json!(tool_definitions(&request.tools));
    }
    body
}

/// Extract `(content, reasoning)` deltas from one stream event payload.
fn delta_parts(json: &serde_json::Value) -> (Option<&str>, Option<&str>) {
    let delta = &json["choices"][0]["delta"];
    let content = delta["content"].as_str();
    // Compatible servers surface reasoning under either key.
    let reasoning = delta["reasoning_content"]
        .as_str()
        .or_else(|| delta["reasoning"].as_str());
    (content, reasoning)
}

/// Fold one stream event into the accumulated reply, reporting a
/// partial when it advanced. Returns `false` on the terminal `[DONE]`.
fn apply_stream_event(
    data: &str,
    text: &mut String,
    thoughts: &mut Option<String>,
    on_chunk: &ChunkFn,
) -> bool {
    if data == "[DONE]" {
        return false;
    }
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => {
            debug!("skipping malformed stream payload: {e}");
            return true;
        }
    };
    let (content, reasoning) = delta_parts(&json);
    if let Some(content) = content {
        text.push_str(content);
    }
    if let Some(reasoning) = reasoning {
        thoughts.get_or_insert_with(String::new).push_str(reasoning);
    }
    if content.is_some() || reasoning.is_some() {
        on_chunk(StreamChunk {
            text: text.clone(),
            thoughts: thoughts.clone(),
        });
    }
    true
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn generate(
        &self,
        request: BackendRequest,
        on_chunk: ChunkFn,
    ) -> Result<BackendReply, BackendError> {
        let history = match &request.context {
            Some(context) => history_from_context(Some(context)),
            None => history_from_context(self.current_context.lock().await.as_ref()),
        };
        let body = build_request_body(&self.config, &request, &history);

        debug!(model = %body["model"], "chat.completions streaming request");

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            return Err(BackendError::Api(format!("HTTP {status}: {text}")));
        }

        let byte_stream = response
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));
        let mut lines = reader.lines();

        let mut parser = SseParser::new();
        let mut text = String::new();
        let mut thoughts: Option<String> = None;

        loop {
            if request.cancelled.load(Ordering::Acquire) {
                debug!("generation cancelled, abandoning stream");
                break;
            }
            let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| BackendError::Network(e.to_string()))?
            else {
                // Stream ended without `[DONE]`; a final event may sit in
                // the parser unterminated by a blank line.
                if let Some(event) = parser.finish() {
                    apply_stream_event(&event.data, &mut text, &mut thoughts, &on_chunk);
                }
                break;
            };
            let Some(event) = parser.feed_line(&line) else {
                continue;
            };
            if !apply_stream_event(&event.data, &mut text, &mut thoughts, &on_chunk) {
                break;
            }
        }

        // Carry the exchange forward: history + this user turn + reply.
        let mut messages = history;
        messages.push(serde_json::json!({ "role": "user", "content": request.text }));
        messages.push(serde_json::json!({ "role": "assistant", "content": text }));
        let context = serde_json::json!({ "messages": messages });
        *self.current_context.lock().await = Some(context.clone());

        Ok(BackendReply {
            text,
            thoughts,
            generated_images: None,
            context: Some(context),
        })
    }

    async fn reset_context(&self) -> Result<(), BackendError> {
        *self.current_context.lock().await = None;
        Ok(())
    }

    async fn set_context(&self, context: serde_json::Value) -> Result<(), BackendError> {
        *self.current_context.lock().await = Some(context);
        Ok(())
    }

    async fn clear_context(&self, _context: &serde_json::Value) -> Result<(), BackendError> {
        // Context is client-held for this provider; nothing to release.
        Ok(())
    }
}
