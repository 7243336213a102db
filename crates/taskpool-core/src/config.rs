//! Engine configuration loaded from `taskpool.toml`.
//!
//! Missing keys take defaults and a missing file means "all defaults".
//! `TASKPOOL_DATABASE_URL` overrides `database_url` from the file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "taskpool.toml";
pub const DATABASE_URL_ENV: &str = "TASKPOOL_DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which [`TaskStore`](crate::ports::TaskStore) backend to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreKind,

    /// Only read when `store = "sqlite"`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_database_url() -> String {
    "sqlite://taskpool.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load `path`, falling back to defaults if it does not exist, then apply
    /// the environment override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var(DATABASE_URL_ENV)
            && !url.is_empty()
        {
            config.database_url = url;
        }

        Ok(config)
    }
}
