use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::Config;
use crate::constants::defaults;
use crate::errors::{BackupError, Result};

pub struct ConfigManager {
    config: Config,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Loads the configuration from `path`, or from the environment/default
    /// location when no path is given. A missing default file means defaults.
    ///
    /// Values are not validated here: command line overrides still apply,
    /// callers run `Config::validate` on the final result.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (candidate, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match std::env::var(defaults::CONFIG_ENV) {
                Ok(value) if !value.trim().is_empty() => (PathBuf::from(value), true),
                _ => (PathBuf::from(defaults::CONFIG_PATH), false),
            },
        };

        if !explicit && fs::metadata(&candidate).await.is_err() {
            debug!(
                "No config file at {}, using built-in defaults",
                candidate.display()
            );
            return Ok(Self {
                config: Config::default(),
                source: None,
            });
        }

        let config = Self::load_file(&candidate).await?;
        info!("Configuration loaded from {}", candidate.display());
        Ok(Self {
            config,
            source: Some(candidate),
        })
    }

    async fn load_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| BackupError::Config {
                reason: format!("failed to read {}: {}", path.display(), e),
            })?;

        let config: Config = toml::from_str(&content).map_err(|e| BackupError::Config {
            reason: format!("failed to parse {}: {}", path.display(), e),
        })?;

        Ok(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// File the configuration came from, `None` for built-in defaults.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}
