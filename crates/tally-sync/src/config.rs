//! # Collector Configuration
//!
//! Everything the collector needs, loaded once at startup.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_TERMINAL_ADDRESS=192.168.1.201                               │
//! │     TALLY_PULL_INTERVAL_SECS=60                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config <path>, else                                              │
//! │     ~/.config/tally/collector.toml (Linux)                             │
//! │     ~/Library/Application Support/com.tally.tally/collector.toml       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # collector.toml
//! [terminal]
//! address = "192.168.1.201"
//! port = 4370
//! password = 0
//! timeout_secs = 10
//! resolve_user_names = true
//!
//! [attendance]
//! interval_secs = 60
//! daily_hour = 23
//! daily_minute = 30
//!
//! [user_sync]
//! interval_secs = 10
//! batch_size = 20
//!
//! [retry]
//! initial_delay_ms = 2000
//! max_delay_secs = 30
//! max_attempts = 10
//!
//! [database]
//! path = "/var/lib/tally/tally.db"
//! max_connections = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::terminal::ZkOptions;

// =============================================================================
// Terminal Settings
// =============================================================================

/// Where the terminal is and how to talk to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Host name or IP address. Required.
    #[serde(default)]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Numeric comm password (0 = none).
    #[serde(default)]
    pub password: u32,

    /// Socket timeout (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Look up user names in the terminal's directory while pulling.
    #[serde(default = "default_true")]
    pub resolve_user_names: bool,
}

fn default_port() -> u16 {
    4370
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for TerminalSettings {
    fn default() -> Self {
        TerminalSettings {
            address: String::new(),
            port: default_port(),
            password: 0,
            timeout_secs: default_timeout(),
            resolve_user_names: true,
        }
    }
}

// =============================================================================
// Loop Settings
// =============================================================================

/// Attendance puller schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSettings {
    /// Interval between polls in `run` mode (seconds).
    #[serde(default = "default_pull_interval")]
    pub interval_secs: u64,

    /// Wall-clock hour of the pull in `daily` mode.
    #[serde(default = "default_daily_hour")]
    pub daily_hour: u32,

    #[serde(default)]
    pub daily_minute: u32,
}

fn default_pull_interval() -> u64 {
    60
}

fn default_daily_hour() -> u32 {
    23
}

impl Default for AttendanceSettings {
    fn default() -> Self {
        AttendanceSettings {
            interval_secs: default_pull_interval(),
            daily_hour: default_daily_hour(),
            daily_minute: 0,
        }
    }
}

/// Provisioning worker schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSyncSettings {
    /// Interval between claims (seconds).
    #[serde(default = "default_user_sync_interval")]
    pub interval_secs: u64,

    /// Most queue items claimed per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_user_sync_interval() -> u64 {
    10
}

fn default_batch_size() -> u32 {
    20
}

impl Default for UserSyncSettings {
    fn default() -> Self {
        UserSyncSettings {
            interval_secs: default_user_sync_interval(),
            batch_size: default_batch_size(),
        }
    }
}

/// Backoff applied to every terminal and storage operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> u64 {
    2000
}

fn default_max_delay() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_delay_ms: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("com", "tally", "tally")
        .map(|dirs| dirs.data_dir().join("tally.db"))
        .unwrap_or_else(|| PathBuf::from("tally.db"))
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Collector Configuration
// =============================================================================

/// Complete collector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub terminal: TerminalSettings,

    #[serde(default)]
    pub attendance: AttendanceSettings,

    #[serde(default)]
    pub user_sync: UserSyncSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl CollectorConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (collector.toml)
    /// 3. Environment variables
    ///
    /// An explicitly given path must exist; the default path may not.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        match config_path {
            Some(path) => {
                info!(?path, "Loading collector config from file");
                config = Self::read_file(&path)?;
            }
            None => match Self::default_config_path() {
                Some(path) if path.exists() => {
                    info!(?path, "Loading collector config from file");
                    config = Self::read_file(&path)?;
                }
                path => debug!(?path, "Config file not found, using defaults"),
            },
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn read_file(path: &PathBuf) -> SyncResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.terminal.address.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "terminal.address is required".into(),
            ));
        }

        if self.terminal.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "terminal.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.attendance.interval_secs == 0 || self.user_sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "intervals must be greater than 0".into(),
            ));
        }

        if self.user_sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "user_sync.batch_size must be greater than 0".into(),
            ));
        }

        if self.attendance.daily_hour > 23 || self.attendance.daily_minute > 59 {
            return Err(SyncError::InvalidConfig(format!(
                "daily pull time {:02}:{:02} is not a time of day",
                self.attendance.daily_hour, self.attendance.daily_minute
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.retry.initial_delay_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.initial_delay_ms must be greater than 0".into(),
            ));
        }

        if self.retry.max_delay_secs.saturating_mul(1000) < self.retry.initial_delay_ms {
            return Err(SyncError::InvalidConfig(format!(
                "retry.max_delay_secs ({}s) is below retry.initial_delay_ms ({}ms)",
                self.retry.max_delay_secs, self.retry.initial_delay_ms
            )));
        }

        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("TALLY_TERMINAL_ADDRESS") {
            debug!(address = %address, "Overriding terminal address from environment");
            self.terminal.address = address;
        }

        env_parse("TALLY_TERMINAL_PORT", &mut self.terminal.port);
        env_parse("TALLY_TERMINAL_PASSWORD", &mut self.terminal.password);
        env_parse("TALLY_TERMINAL_TIMEOUT_SECS", &mut self.terminal.timeout_secs);
        env_parse("TALLY_RESOLVE_USER_NAMES", &mut self.terminal.resolve_user_names);
        env_parse("TALLY_PULL_INTERVAL_SECS", &mut self.attendance.interval_secs);
        env_parse("TALLY_DAILY_PULL_HOUR", &mut self.attendance.daily_hour);
        env_parse("TALLY_DAILY_PULL_MINUTE", &mut self.attendance.daily_minute);
        env_parse("TALLY_USER_SYNC_INTERVAL_SECS", &mut self.user_sync.interval_secs);
        env_parse("TALLY_USER_SYNC_BATCH_SIZE", &mut self.user_sync.batch_size);
        env_parse("TALLY_DB_MAX_CONNECTIONS", &mut self.database.max_connections);

        if let Ok(path) = std::env::var("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.config_dir().join("collector.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Connection options for the ZK driver.
    pub fn zk_options(&self) -> ZkOptions {
        ZkOptions {
            port: self.terminal.port,
            password: self.terminal.password,
            timeout: Duration::from_secs(self.terminal.timeout_secs),
            ..ZkOptions::new(self.terminal.address.trim())
        }
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.attendance.interval_secs)
    }

    pub fn user_sync_interval(&self) -> Duration {
        Duration::from_secs(self.user_sync.interval_secs)
    }
}

/// Overwrites `target` with a parsed environment value; bad values are ignored.
fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => {
            debug!(var = name, value = %raw, "Overriding config from environment");
            *target = value;
        }
        Err(_) => warn!(var = name, value = %raw, "Ignoring unparsable environment value"),
    }
}
