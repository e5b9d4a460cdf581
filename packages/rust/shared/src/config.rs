//! Application configuration for Wise.
//!
//! User config lives at `~/.wise/wise.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WiseError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "wise.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".wise";

// ---------------------------------------------------------------------------
// Config structs (matching wise.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Task scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Database settings.
    #[serde(default)]
    pub storage: StorageSection,

    /// Retry policy and fetch settings for the `url_mark` pipeline.
    #[serde(default)]
    pub url_mark: UrlMarkSection,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Maximum number of tasks executing at once.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Seconds between polls of the task table.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Absolute execution deadline per task run, in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            scan_interval_secs: default_scan_interval(),
            task_timeout_secs: default_task_timeout(),
        }
    }
}

fn default_pool_size() -> u32 {
    4
}
fn default_scan_interval() -> u64 {
    10
}
fn default_task_timeout() -> u64 {
    20 * 60
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Path to the libSQL database file. A leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.wise/wise.db".into()
}

/// `[url_mark]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlMarkSection {
    /// Retries allowed after the first failed run.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds a failed run waits before its worker slot is released.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// HTTP timeout for page fetches.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UrlMarkSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_secs: default_retry_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_interval() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size; also the per-tick poll limit.
    pub pool_size: usize,
    /// Interval between scheduler ticks.
    pub scan_interval: Duration,
    /// Absolute deadline for one task run.
    pub task_timeout: Duration,
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            pool_size: config.scheduler.pool_size as usize,
            scan_interval: Duration::from_secs(config.scheduler.scan_interval_secs),
            task_timeout: Duration::from_secs(config.scheduler.task_timeout_secs),
        }
    }
}

/// Runtime configuration for the `url_mark` pipeline.
#[derive(Debug, Clone)]
pub struct UrlMarkConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub request_timeout: Duration,
}

impl From<&AppConfig> for UrlMarkConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_retries: config.url_mark.max_retries,
            retry_interval: Duration::from_secs(config.url_mark.retry_interval_secs),
            request_timeout: Duration::from_secs(config.url_mark.request_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.wise/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| WiseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.wise/wise.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| WiseError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| WiseError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WiseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| WiseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| WiseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings the scheduler cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.scheduler.pool_size == 0 {
        return Err(WiseError::config("scheduler.pool_size must be at least 1"));
    }
    if config.scheduler.scan_interval_secs == 0 {
        return Err(WiseError::config(
            "scheduler.scan_interval_secs must be greater than 0",
        ));
    }
    if config.scheduler.task_timeout_secs == 0 {
        return Err(WiseError::config(
            "scheduler.task_timeout_secs must be greater than 0",
        ));
    }
    Ok(())
}

/// Resolve the configured database path, expanding a leading `~/`.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = config.storage.db_path.as_str();
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| WiseError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
