use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::StreamError;
use crate::frame::BodySlot;

/// Externally visible session state.
///
/// `Closing` exists only inside [`Lifecycle::close`], which holds the lock for
/// the whole transition, so callers observe either `Open` or `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Why a session closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The body ended cleanly.
    Eof,
    /// A terminal completion record was received.
    Completed,
    /// A decode, protocol, transport or API error ended the stream.
    Failed,
    /// A timeout budget fired.
    TimedOut,
    /// The owner called `close`.
    Explicit,
    /// The parent token or an abort handle cancelled the session.
    Cancelled,
    /// The session was dropped while open.
    Dropped,
}

struct Inner {
    state: SessionState,
    reason: Option<CloseReason>,
    // Failure recorded by a background task, reported once by the next pull.
    pending: Option<StreamError>,
}

/// Shared close bookkeeping for one session.
pub(crate) struct Lifecycle {
    request_id: String,
    inner: Mutex<Inner>,
    done: CancellationToken,
    body: Option<BodySlot>,
}

impl Lifecycle {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            inner: Mutex::new(Inner {
                state: SessionState::Open,
                reason: None,
                pending: None,
            }),
            done: CancellationToken::new(),
            body: None,
        }
    }

    /// Attaches the body dropped by whichever close wins.
    pub fn with_body(mut self, body: BodySlot) -> Self {
        self.body = Some(body);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Fires once the session has closed.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.lock().reason
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// Closes the session. Returns `true` if this call performed the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.transition(reason, None)
    }

    /// Records `error` for the next pull and closes. Only the first failure is
    /// kept; later ones are dropped.
    pub fn fail(&self, reason: CloseReason, error: StreamError) -> bool {
        self.transition(reason, Some(error))
    }

    fn transition(&self, reason: CloseReason, error: Option<StreamError>) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Open {
                return false;
            }
            inner.state = SessionState::Closing;
            inner.reason = Some(reason);
            inner.pending = error;
            self.done.cancel();
            inner.state = SessionState::Closed;
        }
        // Done is already cancelled, so the reader treats the empty slot as
        // an abort.
        let released = self.body.as_ref().is_some_and(BodySlot::release);
        debug!(request_id = %self.request_id, ?reason, released, "stream session closed");
        true
    }

    /// Takes the failure recorded by a background close, if not yet reported.
    pub fn take_pending(&self) -> Option<StreamError> {
        self.lock().pending.take()
    }

    /// The error a read interrupted by a close should surface: the recorded
    /// failure (timeout, cancellation) or a bare cancellation.
    pub fn interrupted_error(&self) -> StreamError {
        self.take_pending()
            .unwrap_or_else(|| StreamError::cancelled(self.request_id.clone()))
    }
}
