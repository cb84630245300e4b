//! Server configuration.
//!
//! Read from an optional JSON file, then overridden by environment
//! variables. Missing fields fall back to [`Config::default`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::constants::{DEFAULT_CONNECTION, ENV_CONNECTION, ENV_TASK_LOG_DIR, TASK_UMASK};

/// Configuration for the supervisor server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Listening address: `host:port` or a Unix socket path.
    pub connection: String,
    /// Directory for per-task stdout/stderr logs. Task output is discarded
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_log_dir: Option<PathBuf>,
    /// Umask applied to launched tasks.
    pub task_umask: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: DEFAULT_CONNECTION.to_string(),
            task_log_dir: None,
            task_umask: TASK_UMASK,
        }
    }
}

impl Config {
    /// Loads `path` (if given) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(connection) = lookup(ENV_CONNECTION).filter(|v| !v.is_empty()) {
            self.connection = connection;
        }

        if let Some(dir) = lookup(ENV_TASK_LOG_DIR).filter(|v| !v.is_empty()) {
            self.task_log_dir = Some(PathBuf::from(dir));
        }
    }
}
