//! Tracing configuration and log routing.
//!
//! Every docstream process (API server, worker pool, sweeper) logs to stdout with a compact
//! formatter and appends the same events to a file: `DOCSTREAM_LOG_FILE` when set, otherwise
//! `logs/docstream.log`. Pipeline events carry structured `job_id`, `document_id`, `attempt` and
//! `stage` fields so one job can be followed across workers and redeliveries.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_ENV: &str = "DOCSTREAM_LOG_FILE";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_NAME: &str = "docstream.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// Respects `RUST_LOG` (defaults to `info`). When the log file cannot be opened the process
/// keeps logging to stdout only. Calling this twice is a no-op.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let file_layer = open_log_file(&log_path(std::env::var(LOG_FILE_ENV).ok())).map(|file| {
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = LOG_GUARD.set(guard);
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact()
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}

/// File the logs are appended to.
fn log_path(configured: Option<String>) -> PathBuf {
    configured
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR).join(DEFAULT_LOG_NAME))
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty())
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create log directory {}: {err}", parent.display());
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", path.display());
            None
        }
    }
}
