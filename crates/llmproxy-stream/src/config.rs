use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::telemetry::Telemetry;

const TTFT_ENV: &str = "LLMPROXY_STREAM_TTFT_MS";
const IDLE_ENV: &str = "LLMPROXY_STREAM_IDLE_MS";
const TOTAL_ENV: &str = "LLMPROXY_STREAM_TOTAL_MS";

/// Invalid stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held something other than a millisecond count.
    #[error("invalid value for {key}: {value:?} (expected milliseconds)")]
    InvalidValue { key: String, value: String },
}

/// Timeout budgets enforced while a stream is open.
///
/// A zero budget is disabled. When every budget is zero no supervisor task is
/// started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutBudgets {
    /// Time-to-first-token budget.
    #[serde(default)]
    pub ttft_ms: u64,
    /// Maximum gap between two non-empty frames.
    #[serde(default)]
    pub idle_ms: u64,
    /// Maximum lifetime of the stream.
    #[serde(default)]
    pub total_ms: u64,
}

impl TimeoutBudgets {
    /// Budgets with every timer disabled.
    pub const fn none() -> Self {
        Self {
            ttft_ms: 0,
            idle_ms: 0,
            total_ms: 0,
        }
    }

    /// Reads budgets from `LLMPROXY_STREAM_TTFT_MS`, `LLMPROXY_STREAM_IDLE_MS`
    /// and `LLMPROXY_STREAM_TOTAL_MS`. Unset variables leave the budget disabled.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| -> Result<u64, ConfigError> {
            match lookup(key) {
                None => Ok(0),
                Some(raw) if raw.trim().is_empty() => Ok(0),
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
            }
        };
        Ok(Self {
            ttft_ms: read(TTFT_ENV)?,
            idle_ms: read(IDLE_ENV)?,
            total_ms: read(TOTAL_ENV)?,
        })
    }

    /// Sets the time-to-first-token budget.
    pub fn ttft(mut self, budget: Duration) -> Self {
        self.ttft_ms = duration_ms(budget);
        self
    }

    /// Sets the idle budget.
    pub fn idle(mut self, budget: Duration) -> Self {
        self.idle_ms = duration_ms(budget);
        self
    }

    /// Sets the total budget.
    pub fn total(mut self, budget: Duration) -> Self {
        self.total_ms = duration_ms(budget);
        self
    }

    pub fn ttft_budget(&self) -> Option<Duration> {
        enabled(self.ttft_ms)
    }

    pub fn idle_budget(&self) -> Option<Duration> {
        enabled(self.idle_ms)
    }

    pub fn total_budget(&self) -> Option<Duration> {
        enabled(self.total_ms)
    }

    /// True when at least one budget is set.
    pub fn is_active(&self) -> bool {
        self.ttft_ms > 0 || self.idle_ms > 0 || self.total_ms > 0
    }
}

fn enabled(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn duration_ms(budget: Duration) -> u64 {
    u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)
}

/// Per-session settings supplied by the caller that opened the response.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Correlation id reported by `request_id()` and carried by every error.
    pub request_id: String,
    /// Timeout budgets for this stream.
    pub budgets: TimeoutBudgets,
    /// Parent cancellation; cancelling it closes the session.
    pub cancel: Option<tokio_util::sync::CancellationToken>,
    /// Observer invoked once per decoded event.
    pub telemetry: Telemetry,
}

impl SessionOptions {
    /// Creates options for the given correlation id. A blank id is replaced by
    /// a generated one when the session opens.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            budgets: TimeoutBudgets::none(),
            cancel: None,
            telemetry: Telemetry::noop(),
        }
    }

    /// Sets the timeout budgets.
    pub fn budgets(mut self, budgets: TimeoutBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Ties the session to a parent cancellation token.
    pub fn cancel_token(mut self, token: tokio_util::sync::CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Installs a telemetry observer.
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub(crate) fn resolved_request_id(&self) -> String {
        let trimmed = self.request_id.trim();
        if trimmed.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            trimmed.to_string()
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(String::new())
    }
}
