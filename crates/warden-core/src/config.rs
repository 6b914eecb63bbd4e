//! Warden configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Operator-declared tasks (`[[task]]` tables).
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskConfig>,
}

impl WardenConfig {
    /// Load config from `WARDEN_CONFIG` or the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("WARDEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| WardenError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Structural checks that don't need the schedule evaluator.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(WardenError::Config("scheduler.tick_secs must be > 0".into()));
        }
        if self.scheduler.history_limit == 0 {
            return Err(WardenError::Config(
                "scheduler.history_limit must be > 0".into(),
            ));
        }
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(WardenError::Config("task name must not be empty".into()));
            }
            match (&task.command, &task.url) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(WardenError::Config(format!(
                        "task '{}' must declare exactly one of `command` or `url`",
                        task.name
                    )));
                }
            }
            if let Some(retry) = &task.retry
                && retry.max_attempts == 0
            {
                return Err(WardenError::Config(format!(
                    "task '{}': retry.max_attempts must be > 0",
                    task.name
                )));
            }
        }
        Ok(())
    }

    /// Get the default config path (~/.warden/config.toml).
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Warden home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warden")
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_catch_up_window_secs")]
    pub catch_up_window_secs: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Lease holder identity. Empty means `hostname:pid:uuid`.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
    #[serde(default = "default_retention_schedule")]
    pub retention_schedule: String,
    /// Lease TTL overrides keyed by task category.
    #[serde(default)]
    pub lease_ttl_secs: BTreeMap<String, u64>,
}

fn bool_true() -> bool { true }
fn default_db_path() -> String { "~/.warden/scheduler.db".into() }
fn default_tick_secs() -> u64 { 15 }
fn default_catch_up_window_secs() -> u64 { 3600 }
fn default_timezone() -> String { "UTC".into() }
fn default_history_limit() -> usize { 200 }
fn default_history_retention_days() -> u32 { 30 }
fn default_retention_schedule() -> String { "@daily".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tick_secs: default_tick_secs(),
            catch_up_window_secs: default_catch_up_window_secs(),
            timezone: default_timezone(),
            instance_id: String::new(),
            history_limit: default_history_limit(),
            history_retention_days: default_history_retention_days(),
            retention_schedule: default_retention_schedule(),
            lease_ttl_secs: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

/// Admin HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Shared secret expected in `X-Admin-Token`. Empty disables the check.
    #[serde(default)]
    pub admin_token: String,
}

fn default_port() -> u16 { 7878 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_port(),
            host: default_host(),
            admin_token: String::new(),
        }
    }
}

/// One operator-declared task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub schedule: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub catch_up: bool,
    /// Shell command to run.
    #[serde(default)]
    pub command: Option<String>,
    /// URL to request.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_category() -> String { "maintenance".into() }
fn default_method() -> String { "GET".into() }
fn default_timeout_secs() -> u64 { 300 }

/// Retry policy as written in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: String,
    pub base_delay_secs: u64,
}

fn default_backoff() -> String { "fixed".into() }
