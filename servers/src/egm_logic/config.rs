use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lib_g2s::configs::protocol::ProtocolConfig;
use lib_g2s::loggers::LoggingOptions;
use serde::{Deserialize, Serialize};

/// One simulated host from the configuration file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub host_id: i32,
    pub uri: String,
    #[serde(default)]
    pub required_for_play: bool,
    #[serde(default)]
    pub index: i32,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "G2S EGM simulator: runs the protocol core against simulated hosts", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "EGM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "EGM_LOG_DIR", help = "Directory for the rolling JSON log.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "EGM_LOG_LEVEL", help = "Log filter used when RUST_LOG is unset (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "EGM_ID", help = "Identifier of this EGM.")]
    pub egm_id: Option<String>,

    #[clap(long, env = "EGM_RETRY_COUNT", help = "Default retries for request sessions.")]
    pub retry_count: Option<u32>,

    #[clap(long, env = "EGM_SESSION_TIMEOUT_MS", help = "Per-attempt session timeout in milliseconds.")]
    pub session_timeout_ms: Option<u64>,

    #[clap(long, env = "EGM_TIME_TO_LIVE_MS", help = "Time-to-live stamped on outbound commands, in milliseconds.")]
    pub time_to_live_ms: Option<u64>,

    #[clap(long, env = "EGM_MAX_QUEUE_SIZE", help = "Maximum outbound queue depth per host.")]
    pub max_queue_size: Option<usize>,

    #[clap(long, env = "EGM_OFFLINE_TIMER_MS", help = "Host silence in milliseconds before it is marked offline.")]
    pub offline_timer_ms: Option<u64>,

    #[clap(long, env = "EGM_HISTORY_DEPTH", help = "Command events kept for late monitor subscribers.")]
    pub history_depth: Option<usize>,

    #[clap(long, env = "EGM_KEEP_ALIVE_MS", help = "Interval in milliseconds between simulated host keepAlive requests.")]
    pub keep_alive_ms: Option<u64>,

    #[clap(long, env = "EGM_HOST_LATENCY_MS", help = "Simulated transport latency in milliseconds.")]
    pub host_latency_ms: Option<u64>,

    #[clap(long, env = "EGM_STATS_INTERVAL_SECONDS", help = "Interval in seconds between queue statistics log lines.")]
    pub stats_interval_seconds: Option<u64>,

    #[clap(skip)]
    pub hosts: Option<Vec<HostEntry>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            egm_id: other.egm_id.or(self.egm_id),
            retry_count: other.retry_count.or(self.retry_count),
            session_timeout_ms: other.session_timeout_ms.or(self.session_timeout_ms),
            time_to_live_ms: other.time_to_live_ms.or(self.time_to_live_ms),
            max_queue_size: other.max_queue_size.or(self.max_queue_size),
            offline_timer_ms: other.offline_timer_ms.or(self.offline_timer_ms),
            history_depth: other.history_depth.or(self.history_depth),
            keep_alive_ms: other.keep_alive_ms.or(self.keep_alive_ms),
            host_latency_ms: other.host_latency_ms.or(self.host_latency_ms),
            stats_interval_seconds: other.stats_interval_seconds.or(self.stats_interval_seconds),
            hosts: other.hosts.or(self.hosts),
        }
    }

    /// Protocol settings, validated.
    pub fn protocol_config(&self) -> Result<ProtocolConfig> {
        let defaults = ProtocolConfig::default();
        let config = ProtocolConfig {
            egm_id: self.egm_id.clone().unwrap_or(defaults.egm_id),
            default_retry_count: self.retry_count.unwrap_or(defaults.default_retry_count),
            session_timeout_ms: self.session_timeout_ms.unwrap_or(defaults.session_timeout_ms),
            time_to_live_ms: self.time_to_live_ms.unwrap_or(defaults.time_to_live_ms),
            max_queue_size: self.max_queue_size.unwrap_or(defaults.max_queue_size),
            offline_timer_ms: self.offline_timer_ms.unwrap_or(defaults.offline_timer_ms),
            history_depth: self.history_depth.unwrap_or(defaults.history_depth),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn logging_options(&self) -> LoggingOptions {
        let defaults = LoggingOptions::default();
        LoggingOptions {
            level: self.log_level.clone().unwrap_or(defaults.level),
            log_dir: self.log_dir.clone(),
            file_prefix: "server_egm".to_string(),
            ..defaults
        }
    }

    pub fn hosts(&self) -> Vec<HostEntry> {
        self.hosts.clone().unwrap_or_default()
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        keep_alive_ms: Some(5_000),
        host_latency_ms: Some(20),
        stats_interval_seconds: Some(30),
        hosts: Some(vec![HostEntry {
            host_id: 1,
            uri: "http://127.0.0.1:8080/g2s".to_string(),
            required_for_play: true,
            index: 1,
        }]),
        ..Default::default()
    }
}

/// Defaults, then the JSON file, then CLI flags and environment variables.
pub fn load_config() -> Result<Config> {
    // 1. Load defaults
    let mut current_config = defaults();

    // 2. Load from config file (server_egm.conf) if present.
    let cli_args = Config::parse();
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_egm.conf"));

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    }

    // 3. Override with environment variables and CLI arguments
    Ok(current_config.merge(cli_args))
}
