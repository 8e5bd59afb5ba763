//! Incremental Server-Sent Events parsing.
//!
//! Providers stream responses as SSE. The parser here is fed one line
//! at a time by the backend's read loop, which keeps cancellation
//! checks in the caller's hands between events.

/// A single parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The event type (e.g. `message_start`), when the stream names one.
    pub event: Option<String>,
    /// The event data, JSON in every provider this engine talks to.
    pub data: String,
}

/// Accumulates `event:`/`data:` lines until a blank line completes an
/// event.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline). Returns a complete
    /// event when the line terminates one.
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            return Some(SseEvent {
                event: self.event.take(),
                data: std::mem::take(&mut self.data),
            });
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // id:, retry:, and comment lines are ignored.
        None
    }

    /// Flush a final event left unterminated at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data),
        })
    }
}
