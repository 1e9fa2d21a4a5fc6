use std::fmt;
use std::time::Duration;

/// Which timeout budget fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// No content-bearing record arrived within the time-to-first-token budget.
    Ttft,
    /// The gap between two non-empty frames exceeded the idle budget.
    Idle,
    /// The stream stayed open longer than the total budget.
    Total,
}

impl TimeoutKind {
    /// Returns the stable lowercase name (`ttft`, `idle`, `total`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ttft => "ttft",
            Self::Idle => "idle",
            Self::Total => "total",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry bookkeeping attached by the transport layer.
///
/// This crate never decides retries; the metadata only travels with
/// [`StreamError::Http`] so callers can report what happened before the stream
/// was opened.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetryMetadata {
    /// Number of attempts made, including the first one.
    pub attempts: u32,
    /// Backoff applied before the last attempt, in milliseconds.
    #[serde(default)]
    pub last_backoff_ms: u64,
    /// HTTP status observed on the last attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
}

/// Errors produced while decoding a streaming response.
///
/// Every error returned from a pull or collect call is terminal: the session
/// is already closed when the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Reading the body failed, or a record could not be decoded.
    #[error("transport error (request {request_id}): {message}")]
    Transport { request_id: String, message: String },
    /// A well-formed record broke the format contract (missing type, missing
    /// payload, premature end of stream).
    #[error("protocol error (request {request_id}): {message}")]
    Protocol { request_id: String, message: String },
    /// A timeout budget fired.
    #[error("{kind} timeout after {after:?} (request {request_id})")]
    Timeout {
        request_id: String,
        kind: TimeoutKind,
        after: Duration,
    },
    /// The remote service sent an explicit `error` record.
    #[error("api error {status} (request {request_id}): {message}")]
    Api {
        request_id: String,
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// The response was not a successful streaming response.
    #[error("http status {status} (request {request_id}): {message}")]
    Http {
        request_id: String,
        status: u16,
        message: String,
        retry: Option<RetryMetadata>,
    },
    /// The session was cancelled by its parent token or an abort handle.
    #[error("stream cancelled (request {request_id})")]
    Cancelled { request_id: String },
}

impl StreamError {
    /// Creates a transport error.
    pub fn transport(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            request_id: request_id.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol violation error.
    pub fn protocol(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            request_id: request_id.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error for the given budget.
    pub fn timeout(request_id: impl Into<String>, kind: TimeoutKind, after: Duration) -> Self {
        Self::Timeout {
            request_id: request_id.into(),
            kind,
            after,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(request_id: impl Into<String>) -> Self {
        Self::Cancelled {
            request_id: request_id.into(),
        }
    }

    /// Attaches retry metadata to an HTTP error. Other variants are returned
    /// unchanged.
    pub fn with_retry(self, metadata: RetryMetadata) -> Self {
        match self {
            Self::Http {
                request_id,
                status,
                message,
                ..
            } => Self::Http {
                request_id,
                status,
                message,
                retry: Some(metadata),
            },
            other => other,
        }
    }

    /// Returns the correlation id of the stream that failed.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Transport { request_id, .. }
            | Self::Protocol { request_id, .. }
            | Self::Timeout { request_id, .. }
            | Self::Api { request_id, .. }
            | Self::Http { request_id, .. }
            | Self::Cancelled { request_id } => request_id,
        }
    }

    /// True for transport errors, including protocol violations (which are
    /// transport errors without an underlying cause).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }

    /// True for protocol violations only.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Returns the timeout kind when this is a timeout error.
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            Self::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the HTTP-ish status carried by API and HTTP errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the retry metadata attached by the transport layer.
    pub fn retry_metadata(&self) -> Option<&RetryMetadata> {
        match self {
            Self::Http { retry, .. } => retry.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_transport_errors_without_cause() {
        let err = StreamError::protocol("req-1", "missing type");
        assert!(err.is_transport());
        assert!(err.is_protocol());
        assert_eq!(err.request_id(), "req-1");

        let err = StreamError::transport("req-1", "connection reset");
        assert!(err.is_transport());
        assert!(!err.is_protocol());
    }

    #[test]
    fn timeout_display_names_kind_and_budget() {
        let err = StreamError::timeout("req-2", TimeoutKind::Idle, Duration::from_millis(250));
        assert_eq!(err.timeout_kind(), Some(TimeoutKind::Idle));
        let text = err.to_string();
        assert!(text.contains("idle timeout"), "{text}");
        assert!(text.contains("req-2"), "{text}");
    }

    #[test]
    fn retry_metadata_only_attaches_to_http_errors() {
        let meta = RetryMetadata {
            attempts: 3,
            last_backoff_ms: 400,
            last_status: Some(503),
        };
        let http = StreamError::Http {
            request_id: "r".into(),
            status: 503,
            message: "unavailable".into(),
            retry: None,
        }
        .with_retry(meta.clone());
        assert_eq!(http.retry_metadata(), Some(&meta));
        assert_eq!(http.status(), Some(503));

        let cancelled = StreamError::cancelled("r").with_retry(meta);
        assert_eq!(cancelled.retry_metadata(), None);
    }
}
