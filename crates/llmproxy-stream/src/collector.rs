//! Folding a chat stream into one response.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::body::{ChatFormat, TextFold};
use crate::errors::StreamError;
use crate::event::{StreamEvent, ToolCall, Usage};
use crate::session::StreamSession;

/// Aggregated result of a chat stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChatResponse {
    pub request_id: String,
    pub response_id: String,
    pub model: String,
    pub stop_reason: String,
    pub usage: Option<Usage>,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    fn finish(self) -> ToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&self.arguments).unwrap_or(Value::String(self.arguments))
        };
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Incremental fold of chat events. Metadata fields keep the last non-empty
/// value seen; text follows the format's [`TextFold`].
pub struct ChatCollector {
    fold: TextFold,
    response: ChatResponse,
    partial_calls: BTreeMap<usize, PartialToolCall>,
}

impl ChatCollector {
    pub fn new(format: ChatFormat) -> Self {
        Self {
            fold: format.text_fold(),
            response: ChatResponse::default(),
            partial_calls: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, event: &StreamEvent) {
        let response = &mut self.response;
        keep_latest(&mut response.response_id, &event.response_id);
        keep_latest(&mut response.model, &event.model);
        keep_latest(&mut response.stop_reason, &event.stop_reason);
        if event.usage.is_some() {
            response.usage = event.usage;
        }
        match self.fold {
            TextFold::Append => response.text.push_str(&event.text_delta),
            TextFold::Replace => keep_latest(&mut response.text, &event.text_delta),
        }
        if !event.tool_calls.is_empty() {
            response.tool_calls = event.tool_calls.clone();
        }
        if let Some(delta) = &event.tool_call_delta {
            let partial = self.partial_calls.entry(delta.index).or_default();
            if let Some(id) = delta.id.as_deref() {
                keep_latest(&mut partial.id, id);
            }
            if let Some(name) = delta.name.as_deref() {
                keep_latest(&mut partial.name, name);
            }
            partial.arguments.push_str(&delta.arguments);
        }
    }

    /// Assembled tool-call deltas follow any complete calls, skipping ids the
    /// complete list already carries.
    pub fn finish(self) -> ChatResponse {
        let mut response = self.response;
        for partial in self.partial_calls.into_values() {
            let call = partial.finish();
            let duplicate = !call.id.is_empty()
                && response.tool_calls.iter().any(|existing| existing.id == call.id);
            if !duplicate {
                response.tool_calls.push(call);
            }
        }
        response
    }
}

fn keep_latest(slot: &mut String, value: &str) {
    if !value.is_empty() {
        value.clone_into(slot);
    }
}

pub(crate) async fn collect_chat(
    mut session: StreamSession,
    cancel: &CancellationToken,
) -> Result<ChatResponse, StreamError> {
    let mut collector = ChatCollector::new(session.format());
    loop {
        let next = if cancel.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = session.next() => Some(next),
            }
        };
        let Some(next) = next else {
            session.abort_handle().abort();
            return Err(StreamError::cancelled(session.request_id()));
        };
        match next? {
            Some(event) => collector.push(&event),
            None => break,
        }
    }
    let mut response = collector.finish();
    response.request_id = session.request_id().to_string();
    Ok(response)
}
