//! # Protocol Configuration
//!
//! Defaults for the G2S protocol engine. The values are externally supplied
//! (a JSON file, or a caller-built struct) and every one of them can still be
//! overridden per request by the APIs that take an explicit retry count or
//! timeout.
//!
//! The serialized form uses camelCase keys so the same file can be shared with
//! the rest of the configuration set:
//!
//! ```json
//! {
//!   "egmId": "EGM_0001",
//!   "defaultRetryCount": 3,
//!   "sessionTimeoutMs": 30000,
//!   "maxQueueSize": 500
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of times a request is re-sent after its session times out.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default wire timeout for one attempt of a request session.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
/// Default time-to-live stamped on outbound commands.
pub const DEFAULT_TIME_TO_LIVE_MS: u64 = 30_000;
/// Default maximum number of commands waiting in one outbound queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 500;
/// Default silence window before a host is considered offline.
pub const DEFAULT_OFFLINE_TIMER_MS: u64 = 30_000;
/// Default number of command events retained for late monitor subscribers.
pub const DEFAULT_HISTORY_DEPTH: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// # Protocol Configuration
///
/// The on-disk shape of the protocol defaults. Missing keys fall back to the
/// `DEFAULT_*` constants of this module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolConfig {
    /// Identifier of this EGM, stamped on every outbound command.
    pub egm_id: String,
    /// Retries attempted for a request whose caller did not specify a count.
    pub default_retry_count: u32,
    /// Per-attempt session timeout, in milliseconds.
    pub session_timeout_ms: u64,
    /// Time-to-live applied to outbound commands, in milliseconds.
    pub time_to_live_ms: u64,
    /// Maximum outbound queue depth per host.
    pub max_queue_size: usize,
    /// Offline timer interval applied to hosts registered without one, in milliseconds.
    pub offline_timer_ms: u64,
    /// Number of command events kept in the monitor history.
    pub history_depth: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            egm_id: "EGM_0000".to_string(),
            default_retry_count: DEFAULT_RETRY_COUNT,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            time_to_live_ms: DEFAULT_TIME_TO_LIVE_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            offline_timer_ms: DEFAULT_OFFLINE_TIMER_MS,
            history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }
}

impl ProtocolConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, is not valid JSON, or
    /// fails [`ProtocolConfig::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: ProtocolConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that would leave the engine unable to make progress.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.egm_id.trim().is_empty() {
            return Err(ConfigError::invalid("egmId", "must not be empty"));
        }
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::invalid("sessionTimeoutMs", "must be greater than zero"));
        }
        if self.time_to_live_ms == 0 {
            return Err(ConfigError::invalid("timeToLiveMs", "must be greater than zero"));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::invalid("maxQueueSize", "must be greater than zero"));
        }
        if self.offline_timer_ms == 0 {
            return Err(ConfigError::invalid("offlineTimerMs", "must be greater than zero"));
        }
        Ok(())
    }

    /// Converts the serialized form into the runtime settings handed to the
    /// protocol components.
    pub fn settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            egm_id: self.egm_id.clone(),
            retry_count: self.default_retry_count,
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            time_to_live: Duration::from_millis(self.time_to_live_ms),
            max_queue_size: self.max_queue_size,
            offline_timer: Duration::from_millis(self.offline_timer_ms),
            history_depth: self.history_depth,
        }
    }
}

impl fmt::Display for ProtocolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProtocolConfig
    EGM id: {},
    Retry count: {},
    Session timeout: {}ms,
    Time to live: {}ms,
    Max queue size: {},
    Offline timer: {}ms,
    History depth: {}
",
            self.egm_id,
            self.default_retry_count,
            self.session_timeout_ms,
            self.time_to_live_ms,
            self.max_queue_size,
            self.offline_timer_ms,
            self.history_depth
        )
    }
}

/// # Protocol Settings
///
/// Runtime form of [`ProtocolConfig`], with durations already converted.
/// Components receive a clone at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Identifier of this EGM.
    pub egm_id: String,
    /// Default retry budget for request sessions.
    pub retry_count: u32,
    /// Default per-attempt session timeout.
    pub session_timeout: Duration,
    /// Default time-to-live for outbound commands.
    pub time_to_live: Duration,
    /// Maximum outbound queue depth per host.
    pub max_queue_size: usize,
    /// Default offline timer interval.
    pub offline_timer: Duration,
    /// Command monitor history depth.
    pub history_depth: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        ProtocolConfig::default().settings()
    }
}
