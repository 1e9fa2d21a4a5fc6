//! Normalized chat events and the decoders that produce them.
//!
//! SSE metadata is extracted opportunistically: a payload that is not JSON, or
//! a field of the wrong shape, leaves the corresponding field empty and the
//! frame is still delivered. NDJSON chat lines are strict: a line that is not a
//! valid envelope is an error.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::frame::RawFrame;

/// Closed set of event kinds. Unknown or empty names map to `Custom`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageStart,
    MessageDelta,
    MessageStop,
    Ping,
    #[default]
    Custom,
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "message_start" => Self::MessageStart,
            "message_delta" => Self::MessageDelta,
            "message_stop" => Self::MessageStop,
            "ping" => Self::Ping,
            _ => Self::Custom,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::MessageDelta => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Ping => "ping",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting reported by the service. Missing counts stay zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A complete tool call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One incremental fragment of a tool call, keyed by `index`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Fragment of the JSON-encoded arguments.
    pub arguments: String,
}

/// One decoded frame in the common shape shared by SSE and NDJSON chat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    /// Event name as it appeared on the wire.
    pub name: String,
    /// Raw frame payload (SSE data or the NDJSON line).
    pub raw: Bytes,
    pub response_id: String,
    pub model: String,
    pub stop_reason: String,
    pub usage: Option<Usage>,
    pub text_delta: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_delta: Option<ToolCallDelta>,
}

impl StreamEvent {
    fn from_name(name: &str, raw: Bytes) -> Self {
        Self {
            kind: EventKind::from_name(name),
            name: name.to_string(),
            raw,
            ..Self::default()
        }
    }

    /// True when the event carries model output (or ends the message), which
    /// disarms the time-to-first-token budget.
    pub fn is_content_bearing(&self) -> bool {
        !self.text_delta.is_empty()
            || !self.tool_calls.is_empty()
            || self.tool_call_delta.is_some()
            || self.kind == EventKind::MessageStop
    }

    /// The raw payload as text, lossily decoded.
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// Builds an event from a non-empty SSE frame.
pub(crate) fn normalize_sse(frame: &RawFrame) -> StreamEvent {
    let mut event = StreamEvent::from_name(&frame.name, frame.data.clone());
    if frame.data.is_empty() {
        return event;
    }
    match serde_json::from_slice::<Value>(&frame.data) {
        Ok(value) => {
            apply_envelope_metadata(&mut event, &value);
            apply_content(&mut event, &value);
        }
        Err(err) => {
            trace!(event = %frame.name, error = %err, "sse data is not json; metadata left empty");
        }
    }
    event
}

#[derive(Deserialize)]
struct ChatEnvelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Decodes one non-blank NDJSON chat line.
pub(crate) fn decode_chat_line(line: &Bytes) -> Result<StreamEvent, serde_json::Error> {
    let envelope: ChatEnvelope = serde_json::from_slice(line)?;
    let mut event = StreamEvent::from_name(&envelope.event, line.clone());
    event.response_id = envelope.response_id.unwrap_or_default();
    event.model = envelope.model.unwrap_or_default();
    event.stop_reason = envelope.stop_reason.unwrap_or_default();
    event.usage = envelope.usage;
    match envelope.data {
        Some(Value::String(text)) => event.text_delta = text,
        Some(value @ Value::Object(_)) => apply_content(&mut event, &value),
        _ => {}
    }
    Ok(event)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

fn typed_field<T: serde::de::DeserializeOwned>(value: &Value, key: &str) -> Option<T> {
    value
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| T::deserialize(v).ok())
}

fn apply_envelope_metadata(event: &mut StreamEvent, value: &Value) {
    if let Some(id) = string_field(value, "response_id") {
        event.response_id = id;
    }
    if let Some(model) = string_field(value, "model") {
        event.model = model;
    }
    if let Some(reason) = string_field(value, "stop_reason") {
        event.stop_reason = reason;
    }
    if let Some(usage) = typed_field::<Usage>(value, "usage") {
        event.usage = Some(usage);
    }
}

// Text may arrive as `delta` (string or `{ "text": .. }`) or `text`.
fn apply_content(event: &mut StreamEvent, value: &Value) {
    let text = match value.get("delta") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(delta @ Value::Object(_)) => string_field(delta, "text"),
        _ => None,
    }
    .or_else(|| string_field(value, "text"));
    if let Some(text) = text {
        event.text_delta = text;
    }
    if let Some(calls) = typed_field::<Vec<ToolCall>>(value, "tool_calls") {
        event.tool_calls = calls;
    }
    if let Some(delta) = typed_field::<ToolCallDelta>(value, "tool_call_delta") {
        event.tool_call_delta = Some(delta);
    }
}
