//! Logging setup and structured lifecycle records for Parley processes.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "parley.obs";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Cli,
    Embedded,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Cli => "cli",
            ProcessKind::Embedded => "embedded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub retention_days: u64,
    /// Mirror records to stderr in compact form.
    pub console: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: String,
}

impl LoggingConfig {
    pub fn new(process: ProcessKind, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            process,
            logs_dir: logs_dir.into(),
            retention_days: 7,
            console: true,
            default_directive: "info".to_string(),
        }
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// `parley.<process>`; files are `<prefix>.YYYY-MM-DD.jsonl`.
    pub fn file_prefix(&self) -> String {
        format!("parley.{}", self.process.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInfo {
    pub process: &'static str,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Keeps the background file writer alive; drop it to flush and stop.
pub struct LoggingGuard {
    _writer: WorkerGuard,
    pub info: LoggingInfo,
}

/// Installs the global subscriber: an env filter, an optional stderr layer
/// and a daily-rotated JSONL file layer. Expired files of the same process
/// are removed first. A subscriber that is already installed is kept.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    fs::create_dir_all(&config.logs_dir)?;
    let file_prefix = config.file_prefix();
    let pruned_files = prune_expired_logs(&config.logs_dir, &file_prefix, config.retention_days)?;

    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(&file_prefix)
        .filename_suffix("jsonl")
        .build(&config.logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_directive)?,
    };
    let file_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_ansi(false)
        .with_writer(writer);
    let console_layer = config
        .console
        .then(|| fmt::layer().compact().with_target(false).with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok(LoggingGuard {
        _writer: guard,
        info: LoggingInfo {
            process: config.process.as_str(),
            logs_dir: config.logs_dir.clone(),
            file_prefix,
            retention_days: config.retention_days,
            pruned_files,
            initialized_at: Utc::now(),
        },
    })
}

pub fn default_logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

/// Removes `<prefix>.YYYY-MM-DD.jsonl` files dated before the retention
/// window. Returns how many files were removed.
pub fn prune_expired_logs(
    logs_dir: &Path,
    prefix: &str,
    retention_days: u64,
) -> anyhow::Result<usize> {
    let today = Utc::now().date_naive();
    let Some(cutoff) = today.checked_sub_days(Days::new(retention_days)) else {
        return Ok(0);
    };

    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, prefix))
            .is_some_and(|date| date < cutoff);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn log_file_date(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// One lifecycle record of a chat request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub chat_id: Option<&'a str>,
    pub message_id: Option<&'a str>,
    pub request_type: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

macro_rules! obs_record {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            chat_id = $event.chat_id.unwrap_or(""),
            message_id = $event.message_id.unwrap_or(""),
            request_type = $event.request_type.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_record!(error, process, event),
        Level::WARN => obs_record!(warn, process, event),
        Level::INFO => obs_record!(info, process, event),
        _ => obs_record!(debug, process, event),
    }
}

/// Replaces user content with its length and a fingerprint.
pub fn redact_text(input: &str) -> String {
    match input.trim() {
        "" => String::new(),
        text => format!(
            "[redacted chars={} fp={}]",
            text.chars().count(),
            fingerprint(text)
        ),
    }
}

pub fn fingerprint(input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
