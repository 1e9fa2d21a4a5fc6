use std::sync::Arc;

use futures::stream;
use reqwest::header::CONTENT_TYPE;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, trace};

use crate::body::{self, ByteStream, ChatFormat, WireFormat};
use crate::collector::{ChatResponse, collect_chat};
use crate::config::SessionOptions;
use crate::errors::StreamError;
use crate::event::{StreamEvent, decode_chat_line, normalize_sse};
use crate::frame::{BodySlot, RawFrame, RawFrameSource, ReadError};
use crate::lifecycle::{CloseReason, Lifecycle, SessionState};
use crate::observability::session_span;
use crate::supervisor::TimeoutSupervisor;
use crate::telemetry::{EventObservation, Telemetry};

/// Handle that closes a session from any task.
///
/// An aborted session reports `StreamError::Cancelled` from the pull that is
/// in flight (or the next one), then end-of-stream.
#[derive(Clone)]
pub struct AbortHandle {
    lifecycle: Arc<Lifecycle>,
}

impl AbortHandle {
    /// Requests cancellation. Has no effect once the session has closed.
    pub fn abort(&self) {
        let error = StreamError::cancelled(self.lifecycle.request_id());
        self.lifecycle.fail(CloseReason::Cancelled, error);
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

/// Lifecycle, reader, supervisor and telemetry shared by both session types.
pub(crate) struct SessionCore {
    lifecycle: Arc<Lifecycle>,
    source: RawFrameSource,
    supervisor: Option<TimeoutSupervisor>,
    parent: Option<CancellationToken>,
    telemetry: Telemetry,
    opened_at: Instant,
}

impl SessionCore {
    pub fn open(format: WireFormat, body: ByteStream, options: SessionOptions) -> Self {
        let opened_at = Instant::now();
        let body = BodySlot::new(body);
        let lifecycle =
            Arc::new(Lifecycle::new(options.resolved_request_id()).with_body(body.clone()));
        let span = session_span(lifecycle.request_id(), format);
        let source = RawFrameSource::open(format, body, lifecycle.done().clone());
        let supervisor =
            TimeoutSupervisor::spawn(options.budgets, lifecycle.clone(), opened_at, span.clone());
        if let Some(parent) = &options.cancel {
            spawn_cancel_watcher(parent.clone(), lifecycle.clone(), span);
        }
        debug!(
            request_id = %lifecycle.request_id(),
            format = %format,
            supervised = supervisor.is_some(),
            "stream session opened"
        );
        let core = Self {
            lifecycle,
            source,
            supervisor,
            parent: options.cancel,
            telemetry: options.telemetry,
            opened_at,
        };
        core.check_parent();
        core
    }

    // The watcher task may not have run yet; a parent cancelled before a pull
    // must still win over buffered data.
    fn check_parent(&self) {
        if self.parent.as_ref().is_some_and(CancellationToken::is_cancelled) {
            let error = StreamError::cancelled(self.lifecycle.request_id());
            self.lifecycle.fail(CloseReason::Cancelled, error);
        }
    }

    pub fn request_id(&self) -> &str {
        self.lifecycle.request_id()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.reason()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// `Ok(true)` while open. Once closed, reports a failure recorded by a
    /// background close exactly once, then `Ok(false)`.
    pub fn ensure_open(&mut self) -> Result<bool, StreamError> {
        self.check_parent();
        if !self.lifecycle.is_closed() {
            return Ok(true);
        }
        self.source.release();
        match self.lifecycle.take_pending() {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    /// Reads the next raw frame. `Ok(None)` is a clean end of body; the caller
    /// decides how to close.
    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>, StreamError> {
        self.check_parent();
        match self.source.next_frame().await {
            Ok(Some(frame)) => {
                if !frame.is_empty()
                    && let Some(supervisor) = &self.supervisor
                {
                    supervisor.frame_received();
                }
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(ReadError::Aborted) => {
                self.source.release();
                Err(self.lifecycle.interrupted_error())
            }
            Err(ReadError::Body(err)) => {
                let error = StreamError::transport(
                    self.request_id(),
                    format!("reading response body failed: {err}"),
                );
                Err(self.fail(error))
            }
        }
    }

    pub fn content_received(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.content_received();
        }
    }

    pub fn observe(&self, name: &str, payload_len: usize) {
        self.telemetry.observe(&EventObservation {
            request_id: self.lifecycle.request_id(),
            format: self.source.format(),
            name,
            payload_len,
            elapsed: self.opened_at.elapsed(),
        });
    }

    /// Closes for `reason` and releases the body.
    pub fn finish(&mut self, reason: CloseReason) {
        self.lifecycle.close(reason);
        self.source.release();
    }

    /// Closes because of an error found by the decoder and returns it. Any
    /// failure a background task recorded concurrently is discarded so the
    /// caller sees exactly one terminal error.
    pub fn fail(&mut self, error: StreamError) -> StreamError {
        self.finish(CloseReason::Failed);
        let _ = self.lifecycle.take_pending();
        debug!(request_id = %self.request_id(), error = %error, "stream session failed");
        error
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.lifecycle.close(CloseReason::Dropped);
    }
}

fn spawn_cancel_watcher(parent: CancellationToken, lifecycle: Arc<Lifecycle>, span: tracing::Span) {
    let watch = async move {
        let done = lifecycle.done().clone();
        tokio::select! {
            biased;
            _ = done.cancelled() => {}
            _ = parent.cancelled() => {
                let error = StreamError::cancelled(lifecycle.request_id());
                if lifecycle.fail(CloseReason::Cancelled, error) {
                    debug!("parent cancelled stream session");
                }
            }
        }
    };
    tokio::spawn(watch.instrument(span));
}

/// Returns the response unchanged when it is a 2xx, otherwise an HTTP error
/// carrying the response body.
pub(crate) async fn check_status(
    response: reqwest::Response,
    request_id: &str,
) -> Result<reqwest::Response, StreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(StreamError::Http {
        request_id: request_id.to_string(),
        status: status.as_u16(),
        message,
        retry: None,
    })
}

/// Pull-based decoder for SSE and NDJSON chat streams.
///
/// Exactly one consumer pulls at a time. Every error is terminal; afterwards
/// `next` returns `Ok(None)`.
pub struct StreamSession {
    core: SessionCore,
    format: ChatFormat,
}

impl StreamSession {
    /// Opens a session over an already-open body.
    ///
    /// Must be called inside a tokio runtime: the timeout supervisor and the
    /// cancellation watcher run as tasks.
    pub fn new(body: ByteStream, format: ChatFormat, options: SessionOptions) -> Self {
        Self {
            core: SessionCore::open(format.wire_format(), body, options),
            format,
        }
    }

    /// Opens a session over a `reqwest` response, picking the format from its
    /// `Content-Type`. Non-2xx responses become [`StreamError::Http`].
    pub async fn from_response(
        response: reqwest::Response,
        mut options: SessionOptions,
    ) -> Result<Self, StreamError> {
        options.request_id = options.resolved_request_id();
        let response = check_status(response, &options.request_id).await?;
        let format = ChatFormat::from_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        Ok(Self::new(body::from_response(response), format, options))
    }

    /// Pulls the next event. `Ok(None)` means end of stream.
    pub async fn next(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        if !self.core.ensure_open()? {
            return Ok(None);
        }
        loop {
            let Some(frame) = self.core.next_frame().await? else {
                self.core.finish(CloseReason::Eof);
                return Ok(None);
            };
            if frame.is_empty() {
                continue;
            }
            let event = match self.format {
                ChatFormat::Sse => normalize_sse(&frame),
                ChatFormat::Ndjson => match decode_chat_line(&frame.data) {
                    Ok(event) => event,
                    Err(err) => {
                        let error = StreamError::transport(
                            self.core.request_id(),
                            format!("invalid ndjson chat line: {err}"),
                        );
                        return Err(self.core.fail(error));
                    }
                },
            };
            if event.is_content_bearing() {
                self.core.content_received();
            }
            self.core.observe(event.kind.as_str(), event.raw.len());
            trace!(request_id = %self.core.request_id(), kind = %event.kind, "stream event");
            return Ok(Some(event));
        }
    }

    /// Closes the session and releases the body. Idempotent.
    pub fn close(&mut self) {
        self.core.finish(CloseReason::Explicit);
    }

    pub fn request_id(&self) -> &str {
        self.core.request_id()
    }

    pub fn format(&self) -> ChatFormat {
        self.format
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

    /// Folds the remaining events into one [`ChatResponse`].
    pub async fn collect(self, cancel: &CancellationToken) -> Result<ChatResponse, StreamError> {
        collect_chat(self, cancel).await
    }

    /// Adapts the session into a `futures::Stream`. The stream ends after the
    /// first error.
    pub fn into_stream(
        self,
    ) -> impl futures::Stream<Item = Result<StreamEvent, StreamError>> + Send {
        stream::try_unfold(self, |mut session| async move {
            Ok(session.next().await?.map(|event| (event, session)))
        })
    }
}
