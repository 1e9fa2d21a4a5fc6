//! Common imports for typical stream consumption.
pub use crate::{
    AbortHandle, ChatFormat, ChatResponse, EventKind, SessionOptions, StreamError, StreamEvent,
    StreamSession, StructuredJsonEvent, StructuredKind, StructuredStream, Telemetry,
    TimeoutBudgets, TimeoutKind,
};
