use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "breachgraph";

/// Install the global subscriber: stderr console output plus a daily-rolling
/// JSON file under `log_dir`.
///
/// `RUST_LOG` takes precedence over `default_level`. Keep the returned guard
/// alive until exit or buffered file output is lost. Calling this twice keeps
/// the first subscriber.
pub fn init_logging(log_dir: &Path, default_level: &str, json_console: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("jsonl")
        .build(log_dir)
        .context("Failed to create log file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(true)
        .with_span_list(false);

    let compact_console = (!json_console).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let json_console = json_console.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(compact_console)
        .with(json_console)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_log_directory_and_tolerates_reinit() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let _first = init_logging(&log_dir, "info", false).unwrap();
        assert!(log_dir.is_dir());
        let _second = init_logging(&log_dir, "debug", true).unwrap();
    }
}
