//! Tracing setup for binaries and the per-session span.
//!
//! Every session opens a `stream_session` span carrying `request_id` and
//! `format`. Background tasks (timeout supervisor, cancellation watcher) run
//! inside it, so their events are attributed to the session in both the
//! console and the JSON output.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing::Span;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::body::WireFormat;

const ENABLED_ENV: &str = "LLMPROXY_OBSERVABILITY_ENABLED";
const LEVEL_ENV: &str = "LLMPROXY_LOG_LEVEL";
const JSON_PATH_ENV: &str = "LLMPROXY_JSON_LOG_PATH";
const CRATE_TARGET: &str = "llmproxy_stream";
const DEFAULT_JSON_FILE: &str = "llmproxy-stream.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

/// Span opened for each session; its fields label every event logged by the
/// session's background tasks.
pub fn session_span(request_id: &str, format: WireFormat) -> Span {
    tracing::debug_span!("stream_session", request_id = %request_id, format = %format)
}

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOutput {
    /// Compact, human-readable lines on stderr.
    Console,
    /// One JSON object per line in the given file.
    JsonFile(PathBuf),
}

/// Resolved logging settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// `EnvFilter` directives.
    pub filter: String,
    pub output: LogOutput,
}

impl LogSettings {
    /// Reads `LLMPROXY_OBSERVABILITY_ENABLED`, `LLMPROXY_LOG_LEVEL` (falling
    /// back to `RUST_LOG`) and `LLMPROXY_JSON_LOG_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup(ENABLED_ENV)
            .and_then(|v| parse_bool_env(&v))
            .unwrap_or(true);
        let filter = lookup(LEVEL_ENV)
            .or_else(|| lookup(EnvFilter::DEFAULT_ENV))
            .map(|raw| scoped_filter(&raw))
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| scoped_filter("info"));
        let output = match lookup(JSON_PATH_ENV) {
            Some(path) if !path.trim().is_empty() => LogOutput::JsonFile(PathBuf::from(path.trim())),
            _ => LogOutput::Console,
        };
        Self {
            enabled,
            filter,
            output,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(scoped_filter("info")))
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

// A bare level applies to this crate only and keeps dependencies (reqwest,
// hyper, rustls) at `warn`. Full directives pass through unchanged.
fn scoped_filter(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains('=') || raw.contains(',') {
        return raw.to_string();
    }
    format!("warn,{CRATE_TARGET}={raw}")
}

/// Initialize logging once per process.
///
/// Library code only emits `tracing` events; binaries and demos call this to
/// see them. Settings come from [`LogSettings::from_env`].
pub fn init_observability() {
    INIT.get_or_init(|| install(LogSettings::from_env()));
}

fn install(settings: LogSettings) {
    if !settings.enabled {
        return;
    }
    let filter = settings.env_filter();
    match settings.output {
        LogOutput::JsonFile(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let _ = std::fs::create_dir_all(&dir);
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_JSON_FILE)
                .to_string();
            // `request_id` and `format` land in the `span` object of each line.
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(tracing_appender::rolling::never(dir, file_name));
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init();
        }
        LogOutput::Console => {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init();
        }
    }
}
