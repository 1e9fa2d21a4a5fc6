//! Client-side decoder for streaming LLM-proxy responses.
//!
//! Three wire formats are supported: SSE chat events, NDJSON chat envelopes,
//! and NDJSON structured-JSON records decoded into a caller-chosen type.
//! Sessions are pull-based, close exactly once, and enforce optional
//! time-to-first-token, idle and total timeout budgets.
//!
//! # Chat streams
//!
//! ```no_run
//! use llmproxy_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let response = reqwest::get("http://localhost:8080/v1/chat/stream").await?;
//! let options = SessionOptions::new("req-1").budgets(TimeoutBudgets::from_env()?);
//! let mut session = StreamSession::from_response(response, options).await?;
//! while let Some(event) = session.next().await? {
//!     print!("{}", event.text_delta);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Structured streams
//!
//! ```no_run
//! use llmproxy_stream::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(serde::Deserialize)]
//! struct Summary {
//!     title: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let response = reqwest::get("http://localhost:8080/v1/structured").await?;
//! let stream = StructuredStream::<Summary>::from_response(response, SessionOptions::default()).await?;
//! let summary = stream.collect(&CancellationToken::new()).await?;
//! println!("{}", summary.title);
//! # Ok(())
//! # }
//! ```

/// Response body adapters and wire-format selection.
pub mod body;
/// Folding chat events into a single response.
pub mod collector;
/// Timeout budgets and per-session options.
pub mod config;
/// Public error types.
pub mod errors;
/// Normalized chat events and their decoders.
pub mod event;
mod frame;
/// Session state and close reasons.
pub mod lifecycle;
/// Tracing subscriber initialization.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Chat session, abort handle.
pub mod session;
/// Typed structured-JSON streams.
pub mod structured;
mod supervisor;
/// Per-event telemetry hook.
pub mod telemetry;

pub use body::{BoxError, ByteStream, ChatFormat, TextFold, WireFormat};
pub use collector::{ChatCollector, ChatResponse};
pub use config::{ConfigError, SessionOptions, TimeoutBudgets};
pub use errors::{RetryMetadata, StreamError, TimeoutKind};
pub use event::{EventKind, StreamEvent, ToolCall, ToolCallDelta, Usage};
pub use lifecycle::{CloseReason, SessionState};
pub use observability::{LogOutput, LogSettings, init_observability};
pub use session::{AbortHandle, StreamSession};
pub use structured::{
    RecordType, StructuredJsonEvent, StructuredKind, StructuredStream, normalize_complete_fields,
};
pub use telemetry::{EventObservation, Telemetry};
