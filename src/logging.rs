//! Logging setup for the `mlprep` binary.
//!
//! Diagnostics always go to stderr so stdout stays free for run summaries.
//! With a log directory, two daily-rotated files are written as well:
//!
//! - `mlprep.<date>.log`: everything the filter lets through
//! - `error.<date>.log`: warnings and errors only
//!
//! The level comes from [`LogOptions::level`] unless `RUST_LOG` is set.
//!
//! ```no_run
//! use mlprep::logging::{self, LogOptions};
//!
//! logging::init(&LogOptions { level: "debug".into(), log_dir: None })?;
//! tracing::info!("ready");
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer as _, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Rotated files kept per log.
const MAX_LOG_FILES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `mlprep=debug`.
    pub level: String,
    /// Directory for rotated log files; console only when `None`.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            log_dir: None,
        }
    }
}

/// Platform data directory for log files.
///
/// - Windows: `%APPDATA%/mlprep/logs`
/// - macOS: `~/Library/Application Support/mlprep/logs`
/// - Linux: `~/.local/share/mlprep/logs`
///
/// # Errors
///
/// Returns error if the platform has no data directory.
pub fn default_log_dir() -> Result<PathBuf> {
    let base_dir = dirs::data_dir().context("Failed to determine data directory")?;
    Ok(base_dir.join("mlprep").join("logs"))
}

fn file_appender(log_dir: &Path, prefix: &str) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(log_dir)
        .with_context(|| format!("Failed to create {prefix} log appender"))
}

/// Build the filter: `RUST_LOG` if set, else `level`.
fn env_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))
}

/// Install the global subscriber. Call once, before running a pipeline.
///
/// # Errors
///
/// Returns error if the level is not a valid filter directive or the log
/// directory cannot be created.
pub fn init(options: &LogOptions) -> Result<()> {
    let env_filter = env_filter(&options.level)?;

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (all_logs_layer, error_logs_layer) = match &options.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).with_context(|| {
                format!("Failed to create log directory: {}", log_dir.display())
            })?;
            let all_logs = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_ansi(false)
                .with_writer(file_appender(log_dir, "mlprep")?);
            let error_logs = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_ansi(false)
                .with_writer(file_appender(log_dir, "error")?)
                .with_filter(EnvFilter::new("warn"));
            (Some(all_logs), Some(error_logs))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(all_logs_layer)
        .with(error_logs_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    if let Some(log_dir) = &options.log_dir {
        tracing::debug!("Logging to {}", log_dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir() {
        if let Ok(log_dir) = default_log_dir() {
            assert!(log_dir.ends_with("mlprep/logs") || log_dir.ends_with("mlprep\\logs"));
        }
    }

    #[test]
    fn test_env_filter_rejects_bad_level() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("info").is_ok());
            assert!(env_filter("mlprep=debug,polars=warn").is_ok());
            assert!(env_filter("mlprep=loud").is_err());
        }
    }

    #[test]
    fn test_file_appender_creates_in_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(file_appender(dir.path(), "mlprep").is_ok());
    }
}
