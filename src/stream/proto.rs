//! Wire types for the report stream endpoint.
//!
//! The backend pushes one server-sent event per report. Events tagged
//! `historical` (backlog replayed at open) or `update` (live sample) carry a
//! JSON [`Report`] payload; any other tag is reserved for future server
//! extensions and ignored by this client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry sample from a device.
///
/// Reports are immutable values with no identity beyond their fields. The
/// `temperature_celcius` spelling is the backend's wire contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    /// Measured temperature in degrees Celsius.
    pub temperature_celcius: f64,
    /// Whether the heater was on when the sample was taken.
    pub heater_on: bool,
    /// Source-supplied sample time. Not trusted to be monotonic or unique.
    pub timestamp: DateTime<Utc>,
}

impl Report {
    /// Parses a report from an event's JSON payload.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes the report back to its JSON wire form.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Report-bearing event tags recognized by this client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportEventKind {
    /// Backlog report replayed when the stream opens.
    Historical,
    /// Live report pushed as the device samples.
    Update,
}

impl ReportEventKind {
    /// Maps an SSE event name to a report kind; `None` for reserved tags.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "historical" => Some(Self::Historical),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; `message` when the server sent no `event:` field.
    pub event: String,
    /// Concatenated data payload.
    pub data: String,
}

/// Incremental decoder for the `text/event-stream` framing.
///
/// Feed raw body chunks as they arrive; complete frames are returned as soon
/// as their terminating blank line has been seen. Chunk boundaries may fall
/// anywhere, including inside a UTF-8 sequence or between `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a body chunk and returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let mut line = String::from_utf8_lossy(&raw).into_owned();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if let Some(frame) = self.take_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn take_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment line, commonly used as a keep-alive.
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id, retry, and unknown fields are not used by this client.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}
