//! Typed decoding of structured-JSON streams.
//!
//! Each line is one record: `{"type": "...", "payload": ..., "complete_fields": [...]}`.
//! `update` records carry partial objects, `completion` carries the final one
//! and ends the stream, `error` ends it with an API failure.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::body::{ByteStream, WireFormat};
use crate::config::SessionOptions;
use crate::errors::StreamError;
use crate::lifecycle::{CloseReason, SessionState};
use crate::session::{AbortHandle, SessionCore, check_status};

const DEFAULT_ERROR_STATUS: u16 = 500;
const DEFAULT_ERROR_MESSAGE: &str = "structured stream reported an error";

/// Record types on the wire. Parsed case-insensitively after trimming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    Start,
    Update,
    Completion,
    Error,
    Keepalive,
    Unknown,
}

impl RecordType {
    /// `None` for an empty type, which is a protocol violation.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let kind = match normalized.as_str() {
            "" => return None,
            "start" => Self::Start,
            "update" => Self::Update,
            "completion" => Self::Completion,
            "error" => Self::Error,
            "keepalive" => Self::Keepalive,
            _ => Self::Unknown,
        };
        Some(kind)
    }
}

/// Kinds of record delivered to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructuredKind {
    Update,
    Completion,
}

impl StructuredKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Completion => "completion",
        }
    }
}

impl fmt::Display for StructuredKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded update or completion.
#[derive(Clone, Debug, PartialEq)]
pub struct StructuredJsonEvent<T> {
    pub kind: StructuredKind,
    pub payload: T,
    pub request_id: String,
    /// Field paths the service marked as final. Blank paths are dropped.
    pub complete_fields: BTreeSet<String>,
}

impl<T> StructuredJsonEvent<T> {
    pub fn is_completion(&self) -> bool {
        self.kind == StructuredKind::Completion
    }

    pub fn is_field_complete(&self, path: &str) -> bool {
        self.complete_fields.contains(path)
    }
}

/// Trims each path and drops blanks and duplicates.
pub fn normalize_complete_fields<I, S>(paths: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .map(|path| path.as_ref().trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

#[derive(Deserialize)]
struct WireRecord {
    #[serde(default, rename = "type")]
    record_type: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    complete_fields: Option<Vec<String>>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<Value>,
}

// Anything but an integer in the HTTP status range falls back to the default.
fn status_code(status: Option<&Value>) -> u16 {
    status
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (100..=599).contains(s))
        .unwrap_or(DEFAULT_ERROR_STATUS)
}

fn code_string(code: Value) -> Option<String> {
    match code {
        Value::Null => None,
        Value::String(code) if code.trim().is_empty() => None,
        Value::String(code) => Some(code),
        other => Some(other.to_string()),
    }
}

/// Pull-based decoder yielding typed partial and final objects.
pub struct StructuredStream<T> {
    core: SessionCore,
    _payload: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StructuredStream<T> {
    /// Opens a stream over an already-open body. Requires a tokio runtime.
    pub fn new(body: ByteStream, options: SessionOptions) -> Self {
        Self {
            core: SessionCore::open(WireFormat::StructuredJson, body, options),
            _payload: PhantomData,
        }
    }

    /// Opens a stream over a `reqwest` response. Non-2xx responses become
    /// [`StreamError::Http`].
    pub async fn from_response(
        response: reqwest::Response,
        mut options: SessionOptions,
    ) -> Result<Self, StreamError> {
        options.request_id = options.resolved_request_id();
        let response = check_status(response, &options.request_id).await?;
        Ok(Self::new(crate::body::from_response(response), options))
    }

    /// Pulls the next update or completion.
    ///
    /// Returns `Ok(None)` only after the stream has already ended; a body
    /// that ends before a completion or error record is a protocol error.
    pub async fn next(&mut self) -> Result<Option<StructuredJsonEvent<T>>, StreamError> {
        if !self.core.ensure_open()? {
            return Ok(None);
        }
        loop {
            let Some(frame) = self.core.next_frame().await? else {
                let error = StreamError::protocol(
                    self.core.request_id(),
                    "stream ended without a completion or error record",
                );
                return Err(self.core.fail(error));
            };
            if frame.is_empty() {
                continue;
            }
            let record: WireRecord = match serde_json::from_slice(&frame.data) {
                Ok(record) => record,
                Err(err) => {
                    let error = StreamError::transport(
                        self.core.request_id(),
                        format!("invalid structured record: {err}"),
                    );
                    return Err(self.core.fail(error));
                }
            };
            let raw_type = record.record_type.as_deref().unwrap_or_default();
            let Some(record_type) = RecordType::parse(raw_type) else {
                let error =
                    StreamError::protocol(self.core.request_id(), "record is missing a type");
                return Err(self.core.fail(error));
            };

            let kind = match record_type {
                RecordType::Start | RecordType::Keepalive => {
                    trace!(request_id = %self.core.request_id(), record_type = ?record_type, "structured control record");
                    continue;
                }
                RecordType::Unknown => {
                    debug!(request_id = %self.core.request_id(), record_type = %raw_type, "skipping unknown structured record");
                    continue;
                }
                RecordType::Error => {
                    self.core.content_received();
                    self.core.observe("error", frame.data.len());
                    let message = record
                        .message
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
                    let error = StreamError::Api {
                        request_id: self.core.request_id().to_string(),
                        status: status_code(record.status.as_ref()),
                        code: record.code.and_then(code_string),
                        message,
                    };
                    return Err(self.core.fail(error));
                }
                RecordType::Update => StructuredKind::Update,
                RecordType::Completion => StructuredKind::Completion,
            };

            self.core.content_received();
            let Some(payload) = record.payload.filter(|p| !p.is_null()) else {
                let error = StreamError::protocol(
                    self.core.request_id(),
                    format!("{kind} record is missing a payload"),
                );
                return Err(self.core.fail(error));
            };
            let payload = match serde_json::from_value::<T>(payload) {
                Ok(payload) => payload,
                Err(err) => {
                    let error = StreamError::transport(
                        self.core.request_id(),
                        format!("{kind} payload does not match the expected shape: {err}"),
                    );
                    return Err(self.core.fail(error));
                }
            };
            if kind == StructuredKind::Completion {
                self.core.finish(CloseReason::Completed);
            }
            self.core.observe(kind.as_str(), frame.data.len());
            return Ok(Some(StructuredJsonEvent {
                kind,
                payload,
                request_id: self.core.request_id().to_string(),
                complete_fields: normalize_complete_fields(
                    record.complete_fields.unwrap_or_default(),
                ),
            }));
        }
    }

    /// Drains the stream and returns the completion payload. `cancel` aborts
    /// the drain, including a pull that is blocked on the network.
    pub async fn collect(mut self, cancel: &CancellationToken) -> Result<T, StreamError> {
        loop {
            let next = if cancel.is_cancelled() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = self.next() => Some(next),
                }
            };
            let Some(next) = next else {
                self.core.finish(CloseReason::Cancelled);
                return Err(StreamError::cancelled(self.core.request_id()));
            };
            match next? {
                Some(event) if event.is_completion() => return Ok(event.payload),
                Some(_) => {}
                None => {
                    return Err(StreamError::protocol(
                        self.core.request_id(),
                        "stream ended without a completion or error record",
                    ));
                }
            }
        }
    }
}

impl<T> StructuredStream<T> {
    /// Closes the stream and releases the body. Idempotent.
    pub fn close(&mut self) {
        self.core.finish(CloseReason::Explicit);
    }

    pub fn request_id(&self) -> &str {
        self.core.request_id()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.core.close_reason()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.core.abort_handle()
    }
}
