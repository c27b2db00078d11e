//! Process logging for Baton binaries: a console layer for operators plus a
//! daily JSONL file per process kind, and the structured lifecycle events
//! (`target: "baton.obs"`) emitted around runs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Long-lived run execution.
    Worker,
    /// One-shot inspection commands.
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Worker => "worker",
            ProcessKind::Cli => "cli",
        }
    }

    /// Rotated files are named `<prefix>.YYYY-MM-DD.jsonl`.
    pub fn log_file_prefix(self) -> String {
        format!("baton.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Lifecycle event fields. Only `event` and `component` are required; run
/// scoped events also name the run and the executing instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub instance_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

macro_rules! obs_event {
    ($level:expr, $process:expr, $event:expr) => {
        tracing::event!(
            target: "baton.obs",
            $level,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            run_id = $event.run_id.unwrap_or(""),
            instance_id = $event.instance_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

/// Levels below INFO are reported as INFO; lifecycle events are never debug noise.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_event!(Level::ERROR, process, event),
        Level::WARN => obs_event!(Level::WARN, process, event),
        _ => obs_event!(Level::INFO, process, event),
    }
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), compact
/// stderr output, and a JSON file layer whose lines carry the fields of every
/// open span, so events inside an `agent_run` span are tagged with its
/// `run_id` and `instance_id`. Files older than `retention_days` are pruned
/// once the subscriber is live so removals and failures are logged.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("create logs dir {}", logs_dir.display()))?;
    let file_prefix = process.log_file_prefix();
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&file_prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)
        .with_context(|| format!("open rolling log in {}", logs_dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let json_layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(true);
    let console_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(console_layer)
        .with(json_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!(process = process.as_str(), "global subscriber already installed");
    }

    let today = Utc::now().date_naive();
    let report = prune_expired_logs(logs_dir, &file_prefix, retention_days, today)?;
    for (path, error) in &report.failed {
        tracing::warn!(path = %path.display(), error = %error, "failed to remove expired log file");
    }
    if !report.removed.is_empty() {
        tracing::info!(removed = report.removed.len(), retention_days, "pruned expired log files");
    }

    Ok((
        guard,
        LoggingInitInfo {
            process,
            logs_dir: logs_dir.to_path_buf(),
            file_prefix,
            retention_days,
            pruned_files: report.removed.len(),
            initialized_at: Utc::now(),
        },
    ))
}

/// Console-only logging for short commands that should not touch the logs
/// directory. Quiet (`warn`) unless `RUST_LOG` says otherwise.
pub fn init_cli_logging() {
    let installed = tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

pub fn logs_dir_for_state(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[derive(Debug, Default)]
struct PruneReport {
    removed: Vec<PathBuf>,
    failed: Vec<(PathBuf, String)>,
}

// Keeps today's file plus `retention_days` earlier days.
fn prune_expired_logs(
    logs_dir: &Path,
    file_prefix: &str,
    retention_days: u64,
    today: NaiveDate,
) -> anyhow::Result<PruneReport> {
    let oldest_kept = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(NaiveDate::MIN);
    let mut report = PruneReport::default();
    let entries = fs::read_dir(logs_dir)
        .with_context(|| format!("list logs dir {}", logs_dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| rotated_file_date(name, file_prefix))
        else {
            continue;
        };
        if date >= oldest_kept || !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.removed.push(path),
            Err(err) => report.failed.push((path, err.to_string())),
        }
    }
    Ok(report)
}

fn rotated_file_date(file_name: &str, file_prefix: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(file_prefix)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
