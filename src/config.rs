use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "teamsync.yaml";
const DB_FILE_NAME: &str = "teamsync.db";

pub const ENV_CONFIG_PATH: &str = "TEAMSYNC_CONFIG";
pub const ENV_SERVER_URL: &str = "TEAMSYNC_SERVER_URL";
pub const ENV_DATA_DIR: &str = "TEAMSYNC_DATA_DIR";

/// Process bootstrap configuration. Runtime sync tuning lives in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct AppConfig {
    pub server_url: String,
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3001".to_string(),
            data_dir: PathBuf::from(".teamsync"),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Reads the file named by `TEAMSYNC_CONFIG` (or `teamsync.yaml`), then
    /// applies the environment overrides.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config = Self::from_file(&path)?.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// A missing or empty file yields the defaults.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(AppError::Config(format!(
                    "failed to read {}: {error}",
                    path.display()
                )))
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw)
            .map_err(|error| AppError::Config(format!("invalid {}: {error}", path.display())))
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(server_url) = lookup(ENV_SERVER_URL).filter(|value| !value.trim().is_empty()) {
            self.server_url = server_url.trim().to_string();
        }
        if let Some(data_dir) = lookup(ENV_DATA_DIR).filter(|value| !value.trim().is_empty()) {
            self.data_dir = PathBuf::from(data_dir.trim());
        }
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        let url = self.server_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "serverUrl must be an http(s) URL, got '{}'",
                self.server_url
            )));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("dataDir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }
}
