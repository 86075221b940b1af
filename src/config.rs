//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, UplinkError};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub upload: UploadConfig,
    pub buffer: BufferConfig,
    pub scheduler: SchedulerConfig,
    pub source: SourceConfig,
    pub identity: IdentityConfig,
    pub journal: JournalConfig,
    pub logging: LoggingConfig,
}

/// Remote collector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,

    #[serde(default = "default_upload_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_client_tag")]
    pub client_tag: String,
}

/// Sample buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    /// Size-trigger threshold `C`
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Hard limit is `shed_factor * capacity`; older samples beyond it are shed
    #[serde(default = "default_shed_factor")]
    pub shed_factor: usize,
}

/// Flush scheduling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

/// Sample source configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_sampling_rate_hz")]
    pub sampling_rate_hz: f64,
}

/// Device identity persistence
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_path")]
    pub path: String,
}

/// Delivery journal configuration
#[derive(Debug, Deserialize, Clone)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_journal_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Log output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for a daily rolling log file; stdout only when empty
    #[serde(default)]
    pub file_dir: String,
}

// Default value functions
fn default_endpoint_url() -> String { "http://localhost:8000".to_string() }
fn default_upload_timeout_ms() -> u64 { 10000 }
fn default_client_tag() -> String { format!("motion-uplink/{}", env!("CARGO_PKG_VERSION")) }

fn default_capacity() -> usize { 500 }
fn default_shed_factor() -> usize { 10 }

fn default_flush_interval_ms() -> u64 { 5000 }

fn default_sampling_rate_hz() -> f64 { 50.0 }

fn default_identity_path() -> String { "./state/identity.json".to_string() }

fn default_journal_dir() -> String { "./journal".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_log_level() -> String { "info".to_string() }

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            timeout_ms: default_upload_timeout_ms(),
            client_tag: default_client_tag(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            shed_factor: default_shed_factor(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { flush_interval_ms: default_flush_interval_ms() }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { sampling_rate_hz: default_sampling_rate_hz() }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { path: default_identity_path() }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_journal_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: String::new(),
        }
    }
}

impl SchedulerConfig {
    /// Time-trigger period `T`
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl UploadConfig {
    /// Per-request upload timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use motion_uplink::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        let url = &self.upload.endpoint_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid("endpoint_url must start with http:// or https://"));
        }

        if self.upload.timeout_ms == 0 || self.upload.timeout_ms > 120000 {
            return Err(invalid("timeout_ms must be between 1 and 120000"));
        }

        if self.upload.client_tag.is_empty() {
            return Err(invalid("client_tag cannot be empty"));
        }

        if self.buffer.capacity == 0 || self.buffer.capacity > 100000 {
            return Err(invalid("capacity must be between 1 and 100000"));
        }

        if self.buffer.shed_factor < 2 || self.buffer.shed_factor > 1000 {
            return Err(invalid("shed_factor must be between 2 and 1000"));
        }

        if self.scheduler.flush_interval_ms < 100 || self.scheduler.flush_interval_ms > 600000 {
            return Err(invalid("flush_interval_ms must be between 100 and 600000"));
        }

        if !(self.source.sampling_rate_hz > 0.0 && self.source.sampling_rate_hz <= 1000.0) {
            return Err(invalid("sampling_rate_hz must be greater than 0 and at most 1000"));
        }

        if self.identity.path.is_empty() {
            return Err(invalid("identity path cannot be empty"));
        }

        if self.journal.enabled && self.journal.log_dir.is_empty() {
            return Err(invalid("journal log_dir cannot be empty when enabled"));
        }

        if self.journal.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.journal.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> UplinkError {
    UplinkError::Config(toml::de::Error::custom(msg))
}
