use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::body::{BoxError, WireFormat};

/// What the observer learns about one decoded event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventObservation<'a> {
    pub request_id: &'a str,
    pub format: WireFormat,
    /// Event kind (chat formats) or record type (structured format).
    pub name: &'a str,
    /// Size of the raw frame payload in bytes.
    pub payload_len: usize,
    /// Time since the session was opened.
    pub elapsed: Duration,
}

type ObserverFn = dyn Fn(&EventObservation<'_>) -> Result<(), BoxError> + Send + Sync;

/// Optional per-event observer.
///
/// The observer runs inline on the reading task, so it should return quickly.
/// Errors and panics it produces are logged and otherwise ignored; they never
/// change what the session returns.
#[derive(Clone, Default)]
pub struct Telemetry {
    observer: Option<Arc<ObserverFn>>,
}

impl Telemetry {
    /// An observer that does nothing.
    pub fn noop() -> Self {
        Self { observer: None }
    }

    /// Wraps a closure as an observer.
    pub fn new<F>(observer: F) -> Self
    where
        F: Fn(&EventObservation<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            observer: Some(Arc::new(observer)),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.observer.is_none()
    }

    pub(crate) fn observe(&self, observation: &EventObservation<'_>) {
        let Some(observer) = &self.observer else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| observer(observation))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(request_id = %observation.request_id, error = %err, "telemetry observer failed");
            }
            Err(_) => {
                debug!(request_id = %observation.request_id, "telemetry observer panicked");
            }
        }
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("observer", &self.observer.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
