//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Library code only emits `tracing` events; embedding applications pick a
//! subscriber once at startup:
//! - **Console** ([`init_console`]): human-readable lines on stderr
//! - **JSON** ([`init_json`]): daily-rotated JSON file layer + console layer

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Holds the non-blocking writer guard for file logging.
///
/// The [`WorkerGuard`] must be kept alive for the duration of the process.
/// Dropping it flushes pending log entries and closes the file.
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a console subscriber on stderr.
///
/// `RUST_LOG` overrides `default_level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_console(default_level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install console subscriber: {e}"))
}

/// Install a JSON file subscriber plus a console layer.
///
/// Writes to `{logs_dir}/trustflow.log.YYYY-MM-DD` with daily rotation.
/// Returns a [`LoggingGuard`] that must be kept alive for log flushing.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_json(logs_dir: &Path, default_level: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "trustflow.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install JSON subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Install the subscriber described by `config`.
///
/// JSON output needs `logs_dir`.
///
/// # Errors
///
/// Returns an error when `config.json` is set but no `logs_dir` is given,
/// and propagates errors from [`init_console`] or [`init_json`].
pub fn init_from_config(
    config: &LoggingConfig,
    logs_dir: Option<&Path>,
) -> anyhow::Result<Option<LoggingGuard>> {
    match (config.json, logs_dir) {
        (true, Some(dir)) => init_json(dir, &config.level).map(Some),
        (true, None) => Err(anyhow::anyhow!(
            "logging.json is enabled but no logs directory was given"
        )),
        (false, _) => init_console(&config.level).map(|()| None),
    }
}
