//! File logging for flow-hook.
//!
//! Hooks run inside other programs' pipelines, so nothing but results goes to
//! stdout. Logs go to a daily file under `<root>/logs/`; if that directory is
//! unusable we fall back to stderr at `warn`.

use flow_core::StorageConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "flow-hook.log";
const DEBUG_ENV: &str = "FLOWD_DEBUG_LOG";

/// Installs the global subscriber. Keep the returned guard alive for the
/// process lifetime or buffered lines are lost.
pub fn init() -> Option<WorkerGuard> {
    let storage = StorageConfig::default();
    let logs_dir = storage.logs_dir();

    if let Err(err) = fs_err::create_dir_all(&logs_dir) {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("warn"))
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!(error = %err, dir = %logs_dir.display(), "Log directory unavailable; logging to stderr");
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = std::env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
