//! Configuration infrastructure
//!
//! Settings are layered, later layers overriding earlier ones:
//! 1. Built-in defaults (see [`defaults`])
//! 2. Optional config file (TOML, JSON, YAML or INI, chosen by extension)
//! 3. Environment variables such as `DECKVAULT__WORKERS__PAGE_WORKERS=4`

#![allow(clippy::doc_markdown)]

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DECKVAULT";

/// File name looked up when no explicit config path is given
pub const CONFIG_FILE_NAME: &str = "deckvault.toml";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Durable store settings
    pub database: DatabaseConfig,

    /// Upstream API settings
    pub vault: VaultConfig,

    /// Worker pool sizing and queue limits
    pub workers: WorkerConfig,

    /// Delays, intervals and timeouts
    pub timing: TimingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,

    /// Pool size; each persister holds one connection while it runs
    pub max_connections: u32,
}

/// Upstream API configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Scheme and host of the vault API
    pub base_url: String,

    /// Decks per listing page
    pub page_size: u32,

    /// Request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Client-side request pacing shared by all workers (0 disables pacing)
    pub max_requests_per_second: u32,

    /// User agent sent with every request
    pub user_agent: String,
}

/// Worker configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Page discoverer pool size
    pub page_workers: usize,

    /// Detail fetcher pool size
    pub detail_fetchers: usize,

    /// Persister pool size
    pub persisters: usize,

    /// Pending records above which detail fetchers pause
    pub backpressure_threshold: usize,

    /// Consecutive "upstream unavailable" answers a page worker tolerates
    pub max_consecutive_unavailable: u32,

    /// Hard capacity of the record queue (0 means unbounded)
    pub record_queue_capacity: usize,
}

/// Timing configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Fixed part of the backpressure pause in milliseconds
    pub backpressure_delay_ms: u64,

    /// Upper bound of the random part of the backpressure pause in milliseconds
    pub backpressure_jitter_ms: u64,

    /// First throttle backoff in milliseconds
    pub throttle_base_delay_ms: u64,

    /// Throttle backoff ceiling in milliseconds
    pub throttle_max_delay_ms: u64,

    /// Tailer cycle length in seconds
    pub tail_interval_seconds: u64,

    /// Sentinel file that stops the tailer
    pub stop_file: PathBuf,

    /// Time allowed for workers to wind down before they are aborted
    pub shutdown_timeout_seconds: u64,

    /// Count report interval in seconds
    pub report_interval_seconds: u64,

    /// Number of intervals in the report's running average
    pub report_window: usize,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level (`error`, `warn`, `info`, `debug`, `trace`)
    pub level: String,

    /// Emit JSON lines instead of human readable text
    pub json_format: bool,

    /// Write to stderr
    pub console_output: bool,

    /// Write to a daily rolling file under `directory`
    pub file_output: bool,

    /// Log file directory
    pub directory: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::DATABASE_MAX_CONNECTIONS,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::VAULT_BASE_URL.to_string(),
            page_size: defaults::PAGE_SIZE,
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            user_agent: format!("deckvault/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            page_workers: defaults::PAGE_WORKERS,
            detail_fetchers: defaults::DETAIL_FETCHERS,
            persisters: defaults::PERSISTERS,
            backpressure_threshold: defaults::BACKPRESSURE_THRESHOLD,
            max_consecutive_unavailable: defaults::MAX_CONSECUTIVE_UNAVAILABLE,
            record_queue_capacity: 0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            backpressure_delay_ms: defaults::BACKPRESSURE_DELAY_MS,
            backpressure_jitter_ms: defaults::BACKPRESSURE_JITTER_MS,
            throttle_base_delay_ms: defaults::THROTTLE_BASE_DELAY_MS,
            throttle_max_delay_ms: defaults::THROTTLE_MAX_DELAY_MS,
            tail_interval_seconds: defaults::TAIL_INTERVAL_SECONDS,
            stop_file: PathBuf::from(defaults::STOP_FILE),
            shutdown_timeout_seconds: defaults::SHUTDOWN_TIMEOUT_SECONDS,
            report_interval_seconds: defaults::REPORT_INTERVAL_SECONDS,
            report_window: defaults::REPORT_WINDOW,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            directory: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    /// Loads configuration from defaults, an optional file and the environment.
    ///
    /// An explicit `path` must exist. Without one, `deckvault.toml` in the
    /// working directory and then in the user config directory are tried.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Self::default()).context("Failed to serialize default config")?;
        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                debug!("Loading config file {}", path.display());
                builder = builder.add_source(File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(found) = Self::discover_file() {
                    debug!("Loading config file {}", found.display());
                    builder = builder.add_source(File::from(found).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn discover_file() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("deckvault").join(CONFIG_FILE_NAME))
            .filter(|candidate| candidate.is_file())
    }
}

impl VaultConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl TimingConfig {
    #[must_use]
    pub fn backpressure_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_delay_ms)
    }

    #[must_use]
    pub fn backpressure_jitter(&self) -> Duration {
        Duration::from_millis(self.backpressure_jitter_ms)
    }

    #[must_use]
    pub fn throttle_base_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_base_delay_ms)
    }

    #[must_use]
    pub fn throttle_max_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_max_delay_ms)
    }

    #[must_use]
    pub fn tail_interval(&self) -> Duration {
        Duration::from_secs(self.tail_interval_seconds)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_seconds)
    }
}

/// Default configuration values
pub mod defaults {
    /// Default SQLite database, created next to the working directory
    pub const DATABASE_URL: &str = "sqlite://keyforge_decks.sqlite";

    /// Default connection pool size
    pub const DATABASE_MAX_CONNECTIONS: u32 = 8;

    /// Default vault host
    pub const VAULT_BASE_URL: &str = "https://www.keyforgegame.com";

    /// Decks per listing page served by the vault
    pub const PAGE_SIZE: u32 = 10;

    /// Default request timeout in seconds
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;

    /// Client-side pacing is off by default
    pub const MAX_REQUESTS_PER_SECOND: u32 = 0;

    /// Default page discoverer pool size
    pub const PAGE_WORKERS: usize = 1;

    /// Default detail fetcher pool size
    pub const DETAIL_FETCHERS: usize = 2;

    /// Default persister pool size
    pub const PERSISTERS: usize = 1;

    /// Pending records above which detail fetchers pause
    pub const BACKPRESSURE_THRESHOLD: usize = 100;

    /// A page worker halts once this many consecutive pages were unavailable
    pub const MAX_CONSECUTIVE_UNAVAILABLE: u32 = 5;

    /// Fixed part of the backpressure pause
    pub const BACKPRESSURE_DELAY_MS: u64 = 30_000;

    /// Random part of the backpressure pause
    pub const BACKPRESSURE_JITTER_MS: u64 = 30_000;

    /// First throttle backoff
    pub const THROTTLE_BASE_DELAY_MS: u64 = 1_000;

    /// Throttle backoff ceiling
    pub const THROTTLE_MAX_DELAY_MS: u64 = 60_000;

    /// Default tailer cycle in seconds
    pub const TAIL_INTERVAL_SECONDS: u64 = 300;

    /// Default tailer stop file
    pub const STOP_FILE: &str = "/tmp/stop_page_one_loop";

    /// Default shutdown timeout in seconds
    pub const SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

    /// Default count report interval in seconds
    pub const REPORT_INTERVAL_SECONDS: u64 = 60;

    /// Default running-average window of the count report
    pub const REPORT_WINDOW: usize = 10;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_vault_behaviour() {
        let config = AppConfig::default();
        assert_eq!(config.vault.page_size, 10);
        assert_eq!(config.workers.backpressure_threshold, 100);
        assert_eq!(config.workers.max_consecutive_unavailable, 5);
        assert_eq!(config.timing.tail_interval(), Duration::from_secs(300));
        assert_eq!(config.timing.stop_file, PathBuf::from("/tmp/stop_page_one_loop"));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deckvault.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[database]\nurl = \"sqlite://other.sqlite\"\n\n[workers]\npage_workers = 4\npersisters = 3\n"
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.database.url, "sqlite://other.sqlite");
        assert_eq!(config.workers.page_workers, 4);
        assert_eq!(config.workers.persisters, 3);
        assert_eq!(config.workers.detail_fetchers, defaults::DETAIL_FETCHERS);
        assert_eq!(config.timing.report_window, defaults::REPORT_WINDOW);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
