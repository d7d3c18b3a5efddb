//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Per-class admission limits. `0` means unbounded (still tracked).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    #[serde(default = "default_fetch_limit")]
    pub fetch: u32,
    #[serde(default = "default_transcode_limit")]
    pub transcode: u32,
    #[serde(default = "default_transfer_limit")]
    pub transfer: u32,
}

fn default_fetch_limit() -> u32 {
    4
}

fn default_transcode_limit() -> u32 {
    3
}

fn default_transfer_limit() -> u32 {
    2
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_limit(),
            transcode: default_transcode_limit(),
            transfer: default_transfer_limit(),
        }
    }
}

/// Fetch (aria2c) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_dir")]
    pub output_dir: PathBuf,
    /// Explicit aria2c binary; probed from well-known locations when unset
    #[serde(default)]
    pub aria2c_path: Option<PathBuf>,
    #[serde(default = "default_fetch_total_timeout")]
    pub total_timeout_secs: u64,
    #[serde(default = "default_fetch_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_fetch_poll_interval")]
    pub poll_interval_ms: u64,
    /// Elapsed-time progress cadence when the tool reports nothing parsable
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_wait")]
    pub retry_wait_secs: u64,
    /// Files modified within this window are preferred by the artifact resolver
    #[serde(default = "default_recency_window")]
    pub recency_window_hours: u64,
}

fn default_fetch_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_fetch_total_timeout() -> u64 {
    1800
}

fn default_fetch_idle_timeout() -> u64 {
    300
}

fn default_fetch_poll_interval() -> u64 {
    2000
}

fn default_heartbeat() -> u64 {
    5
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_wait() -> u64 {
    2
}

fn default_recency_window() -> u64 {
    3
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            output_dir: default_fetch_dir(),
            aria2c_path: None,
            total_timeout_secs: default_fetch_total_timeout(),
            idle_timeout_secs: default_fetch_idle_timeout(),
            poll_interval_ms: default_fetch_poll_interval(),
            heartbeat_secs: default_heartbeat(),
            max_tries: default_max_tries(),
            retry_wait_secs: default_retry_wait(),
            recency_window_hours: default_recency_window(),
        }
    }
}

/// Transcode (ffmpeg) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    #[serde(default = "default_encode_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// Encoder threads per job (0 = derive from cores and transcode limit)
    #[serde(default)]
    pub threads: u32,
    #[serde(default = "default_transcode_total_timeout")]
    pub total_timeout_secs: u64,
    #[serde(default = "default_transcode_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_transcode_poll_interval")]
    pub poll_interval_ms: u64,
    /// Directories searched for transcode inputs given by bare name
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<PathBuf>,
}

fn default_encode_dir() -> PathBuf {
    PathBuf::from("encode")
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_crf() -> u8 {
    23
}

fn default_transcode_total_timeout() -> u64 {
    6 * 3600
}

fn default_transcode_idle_timeout() -> u64 {
    600
}

fn default_transcode_poll_interval() -> u64 {
    1000
}

fn default_search_dirs() -> Vec<PathBuf> {
    ["downloads", ".", "videos", "input", "temp"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            output_dir: default_encode_dir(),
            ffmpeg_path: None,
            ffprobe_path: None,
            preset: default_preset(),
            crf: default_crf(),
            threads: 0,
            total_timeout_secs: default_transcode_total_timeout(),
            idle_timeout_secs: default_transcode_idle_timeout(),
            poll_interval_ms: default_transcode_poll_interval(),
            search_dirs: default_search_dirs(),
        }
    }
}

/// Remote upload configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// Directory searched for upload sources given by bare name
    #[serde(default = "default_encode_dir")]
    pub source_dir: PathBuf,
    /// Authorized-user token JSON; transfers are unavailable without it
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_chunk_retry_limit")]
    pub chunk_retry_limit: u32,
    #[serde(default = "default_stall_limit")]
    pub stall_limit: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_file_size() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_chunk_retry_limit() -> u32 {
    5
}

fn default_stall_limit() -> u32 {
    50
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    10_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            source_dir: default_encode_dir(),
            token_file: None,
            max_retries: default_max_retries(),
            max_file_size_bytes: default_max_file_size(),
            chunk_retry_limit: default_chunk_retry_limit(),
            stall_limit: default_stall_limit(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

/// Spawned process handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Time between the graceful stop signal and a forced kill
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Bytes of trailing output kept for failure diagnostics
    #[serde(default = "default_output_tail")]
    pub output_tail_bytes: usize,
}

fn default_grace_period() -> u64 {
    10
}

fn default_output_tail() -> usize {
    4096
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            output_tail_bytes: default_output_tail(),
        }
    }
}

/// Status HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            listen_addr: default_listen_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info,media_relay=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and fills every missing field with its default.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RELAY_LIMIT_FETCH -> limits.fetch
    /// - RELAY_LIMIT_TRANSCODE -> limits.transcode
    /// - RELAY_LIMIT_TRANSFER -> limits.transfer
    /// - RELAY_FETCH_DIR -> fetch.output_dir
    /// - RELAY_ENCODE_DIR -> transcode.output_dir and transfer.source_dir
    /// - RELAY_TOKEN_FILE -> transfer.token_file
    /// - RELAY_STATUS_ADDR -> status.listen_addr
    /// - RELAY_LOG -> logging.filter
    pub fn apply_env_overrides(&mut self) {
        if let Some(limit) = env_parse::<u32>("RELAY_LIMIT_FETCH") {
            self.limits.fetch = limit;
        }
        if let Some(limit) = env_parse::<u32>("RELAY_LIMIT_TRANSCODE") {
            self.limits.transcode = limit;
        }
        if let Some(limit) = env_parse::<u32>("RELAY_LIMIT_TRANSFER") {
            self.limits.transfer = limit;
        }

        if let Some(dir) = env_non_empty("RELAY_FETCH_DIR") {
            self.fetch.output_dir = PathBuf::from(dir);
        }

        // The upload step picks up whatever the encoder wrote
        if let Some(dir) = env_non_empty("RELAY_ENCODE_DIR") {
            self.transcode.output_dir = PathBuf::from(&dir);
            self.transfer.source_dir = PathBuf::from(dir);
        }

        if let Some(path) = env_non_empty("RELAY_TOKEN_FILE") {
            self.transfer.token_file = Some(PathBuf::from(path));
        }

        if let Some(addr) = env_non_empty("RELAY_STATUS_ADDR") {
            self.status.listen_addr = addr;
        }

        if let Some(filter) = env_non_empty("RELAY_LOG") {
            self.logging.filter = filter;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.trim().is_empty())
}
