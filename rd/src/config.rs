//! Configuration loading
//!
//! Runtime configuration comes from the environment, optionally seeded by a
//! YAML config file. Environment wins over file values; the CLI wins over
//! both (handled in main).

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Environment variable: database root (default `./data`)
pub const ENV_DATA_DIR: &str = "RALPHER_DATA_DIR";

/// Environment variable: log level override
pub const ENV_LOG_LEVEL: &str = "RALPHER_LOG_LEVEL";

/// Environment variable: forces connect-mode-only workspaces
pub const ENV_REMOTE_ONLY: &str = "RALPHER_REMOTE_ONLY";

/// Preference key under which the persisted log level lives
pub const PREF_LOG_LEVEL: &str = "log_level";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the database and related files
    pub data_dir: PathBuf,

    /// Log level; `None` defers to the persisted preference
    pub log_level: Option<String>,

    /// Reject spawn-mode workspaces
    pub remote_only: bool,

    /// Backend connection timeout in seconds
    pub connect_timeout_seconds: u64,

    /// State-persistence ticker period in milliseconds
    pub persist_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_level: None,
            remote_only: false,
            connect_timeout_seconds: 15,
            persist_interval_ms: 250,
        }
    }
}

impl Config {
    /// Load from an optional YAML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_yaml::from_str(&raw).context("failed to parse config file")?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.trim().is_empty() {
                self.log_level = Some(level);
            }
        }
        if let Ok(value) = std::env::var(ENV_REMOTE_ONLY) {
            if is_truthy(&value) {
                self.remote_only = true;
            }
        }
    }
}

/// Default config file location (`<config dir>/ralpher/config.yaml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ralpher").join("config.yaml"))
}

/// Case-insensitive truthy parse; only affirmative values count
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Map a configured level name onto a tracing level. `silly` maps to trace
/// and `fatal` to error; tracing has five levels.
pub fn tracing_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "silly" | "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" | "fatal" => Level::ERROR,
        _ => Level::INFO,
    }
}
