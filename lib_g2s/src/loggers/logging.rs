//! # Logging Setup
//!
//! One call installs the process-wide `tracing` subscriber:
//!
//! - an `EnvFilter` taken from `RUST_LOG`, falling back to the configured
//!   level;
//! - a console layer with targets and ANSI colours;
//! - when a log directory is configured, a JSON layer written through a
//!   daily rolling, non-blocking file appender.
//!
//! The returned [`LoggingHandle`] owns the appender's worker guard. Keep it
//! alive for the life of the process; dropping it flushes and stops the file
//! writer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// # Logging Options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingOptions {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`,
    /// `lib_g2s=debug,info`).
    pub level: String,
    /// Directory for the rolling JSON log. `None` disables file output.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the rolling log.
    pub file_prefix: String,
    /// Console output with ANSI colours.
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_prefix: "lib_g2s".to_string(),
            ansi: true,
        }
    }
}

/// Keeps the file writer alive.
#[must_use = "dropping the handle stops the file log"]
pub struct LoggingHandle {
    guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// True if a file layer was installed.
    pub fn writes_file(&self) -> bool {
        self.guard.is_some()
    }
}

fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

/// Installs the global subscriber.
///
/// # Errors
/// `LoggingError` if the log directory cannot be created, the level is not a
/// valid filter, or a subscriber was already installed.
pub fn init_logging(options: &LoggingOptions) -> Result<LoggingHandle, LoggingError> {
    let filter = env_filter(&options.level)?;
    let console_layer = fmt::layer().with_target(true).with_ansi(options.ansi);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = non_blocking(rolling::daily(dir, &options.file_prefix));
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(level = %options.level, file = guard.is_some(), "Logging initialized");
    Ok(LoggingHandle { guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_partial_json() {
        let options: LoggingOptions = serde_json::from_str(r#"{ "level": "debug", "logDir": "/tmp/egm" }"#).unwrap();
        assert_eq!(options.level, "debug");
        assert_eq!(options.log_dir, Some(PathBuf::from("/tmp/egm")));
        assert_eq!(options.file_prefix, "lib_g2s");
        assert!(options.ansi);
    }

    #[test]
    fn test_bad_level_is_rejected() {
        std::env::remove_var("RUST_LOG");
        assert!(matches!(env_filter("lib_g2s=notalevel"), Err(LoggingError::Filter(_))));
    }

    #[test]
    fn test_init_writes_into_log_dir() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let options = LoggingOptions {
            log_dir: Some(dir.path().join("logs")),
            ansi: false,
            ..Default::default()
        };
        // Another test binary may already own the global subscriber.
        if let Ok(handle) = init_logging(&options) {
            assert!(handle.writes_file());
        }
        assert!(dir.path().join("logs").is_dir());
    }
}
