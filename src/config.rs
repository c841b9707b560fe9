//! Configuration module for feedrelay.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::feed::QuotaLimits;
use crate::{RelayError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/feedrelay.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty means console only.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/feedrelay.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Bot configuration: who may subscribe and how much.
///
/// A limit of 0 means unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Usernames allowed to add feeds. Empty allows everybody.
    #[serde(default)]
    pub user_whitelist: Vec<String>,
    /// Maximum subscriptions per chat.
    #[serde(default = "default_max_feeds_per_chat")]
    pub max_feeds_per_chat: u32,
    /// Maximum feeds a single owner may introduce.
    #[serde(default = "default_max_total_feeds_by_owner")]
    pub max_total_feeds_by_owner: u32,
    /// Maximum subscriptions a single owner may hold.
    #[serde(default = "default_max_active_feeds_by_owner")]
    pub max_active_feeds_by_owner: u32,
}

fn default_max_feeds_per_chat() -> u32 {
    10
}

fn default_max_total_feeds_by_owner() -> u32 {
    200
}

fn default_max_active_feeds_by_owner() -> u32 {
    20
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            user_whitelist: Vec::new(),
            max_feeds_per_chat: default_max_feeds_per_chat(),
            max_total_feeds_by_owner: default_max_total_feeds_by_owner(),
            max_active_feeds_by_owner: default_max_active_feeds_by_owner(),
        }
    }
}

impl BotConfig {
    /// Quota limits for admission.
    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            max_feeds_per_destination: self.max_feeds_per_chat,
            max_total_feeds_by_owner: self.max_total_feeds_by_owner,
            max_active_feeds_by_owner: self.max_active_feeds_by_owner,
        }
    }

    /// Check whether a username is on the allow-list.
    ///
    /// The list must be sorted (done by [`Config::parse`]).
    pub fn is_whitelisted(&self, username: &str) -> bool {
        if self.user_whitelist.is_empty() {
            return true;
        }
        self.user_whitelist
            .binary_search_by(|name| name.as_str().cmp(username))
            .is_ok()
    }
}

/// Update engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Period between update passes in seconds.
    #[serde(default = "default_update_interval")]
    pub interval_secs: u64,
    /// Deadline for a single pass in seconds.
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_secs: u64,
    /// Run a pass immediately at startup.
    #[serde(default = "default_run_at_startup")]
    pub run_at_startup: bool,
}

fn default_update_interval() -> u64 {
    3600
}

fn default_pass_timeout() -> u64 {
    60
}

fn default_run_at_startup() -> bool {
    true
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_update_interval(),
            pass_timeout_secs: default_pass_timeout(),
            run_at_startup: default_run_at_startup(),
        }
    }
}

impl UpdateConfig {
    /// Period between passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Deadline of a single pass.
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }
}

/// Quarantine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuarantineConfig {
    /// Rolling failure window in seconds.
    #[serde(default = "default_quarantine_window")]
    pub window_secs: u64,
    /// Failures within the window that drop a feed (0 disables).
    #[serde(default = "default_quarantine_threshold")]
    pub threshold: u32,
}

fn default_quarantine_window() -> u64 {
    12 * 3600
}

fn default_quarantine_threshold() -> u32 {
    9
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            window_secs: default_quarantine_window(),
            threshold: default_quarantine_threshold(),
        }
    }
}

/// Feed fetching configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Total request timeout in seconds.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Maximum feed size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Allow loopback and private network hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    20
}

fn default_total_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            total_timeout_secs: default_total_timeout(),
            max_redirects: default_max_redirects(),
            max_feed_size_bytes: default_max_feed_size(),
            allow_private_hosts: false,
        }
    }
}

/// Request throttling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestsConfig {
    /// Commands allowed per owner within the window (0 = unlimited).
    #[serde(default = "default_max_requests")]
    pub max_per_window: u32,
    /// Throttling window in seconds.
    #[serde(default = "default_request_window")]
    pub window_secs: u64,
}

fn default_max_requests() -> u32 {
    30
}

fn default_request_window() -> u64 {
    3600
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_max_requests(),
            window_secs: default_request_window(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Bot configuration.
    #[serde(default)]
    pub bot: BotConfig,
    /// Update engine configuration.
    #[serde(default)]
    pub update: UpdateConfig,
    /// Quarantine configuration.
    #[serde(default)]
    pub quarantine: QuarantineConfig,
    /// Feed fetching configuration.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Request throttling configuration.
    #[serde(default)]
    pub requests: RequestsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(RelayError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(s).map_err(|e| RelayError::Config(format!("parse error: {e}")))?;
        config.bot.user_whitelist.sort();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FEEDRELAY_DB_PATH`: Override the database path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FEEDRELAY_DB_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.update.interval_secs == 0 {
            return Err(RelayError::Config(
                "update.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.update.pass_timeout_secs == 0 {
            return Err(RelayError::Config(
                "update.pass_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.requests.max_per_window > 0 && self.requests.window_secs == 0 {
            return Err(RelayError::Config(
                "requests.window_secs must be greater than 0 when throttling is enabled"
                    .to_string(),
            ));
        }
        if self.database.max_connections < 3 {
            return Err(RelayError::Config(
                "database.max_connections must be at least 3".to_string(),
            ));
        }
        Ok(())
    }
}
