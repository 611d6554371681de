//! Engine configuration, stored as TOML

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SyncError};

/// Which way content is allowed to flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local changes are pushed and remote changes are pulled.
    Bidirectional,
    /// Remote changes are pulled; local changes never touch the server.
    DownloadOnly,
}

impl Default for SyncDirection {
    fn default() -> Self {
        SyncDirection::Bidirectional
    }
}

/// Configuration of one synchronized folder pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local directory acting as the sync root.
    pub local_root: PathBuf,
    /// Remote folder path acting as the sync root.
    pub remote_root: String,
    #[serde(default)]
    pub direction: SyncDirection,
    /// Identity embedded in conflict-backup filenames.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Seconds between scheduled full passes.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds of filesystem quiet before a change-triggered partial pass.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Extra filename patterns to skip, on top of the built-in junk rules.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// Metadata database location; defaults to `metadata.db` beside the
    /// config file.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_owner() -> String {
    whoami::username()
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_debounce_secs() -> u64 {
    15
}

impl SyncConfig {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            direction: SyncDirection::default(),
            owner: default_owner(),
            poll_interval_secs: default_poll_interval_secs(),
            debounce_secs: default_debounce_secs(),
            ignore_patterns: Vec::new(),
            db_path: None,
        }
    }

    /// Resolved metadata database path.
    pub fn metadata_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => {
                let config = default_config_path()?;
                let dir = config
                    .parent()
                    .ok_or_else(|| SyncError::Config("config path has no parent".into()))?;
                Ok(dir.join("metadata.db"))
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<SyncConfig> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from the default location.
    pub fn load_default() -> Result<SyncConfig> {
        Self::load(&default_config_path()?)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Path of the config file under the user's home directory.
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| SyncError::Config("home directory not found".into()))?;
    Ok(home.join(".docksync").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_toml() {
        let mut config = SyncConfig::new("/data/docs", "/Sites/docs");
        config.direction = SyncDirection::DownloadOnly;
        config.debounce_secs = 5;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("download_only"));
        assert!(toml_str.contains("debounce_secs = 5"));

        let loaded: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(loaded.local_root, config.local_root);
        assert_eq!(loaded.remote_root, config.remote_root);
        assert_eq!(loaded.direction, SyncDirection::DownloadOnly);
        assert_eq!(loaded.debounce_secs, 5);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let loaded: SyncConfig =
            toml::from_str("local_root = \"/data/docs\"\nremote_root = \"/Sites/docs\"\n").unwrap();
        assert_eq!(loaded.direction, SyncDirection::Bidirectional);
        assert_eq!(loaded.poll_interval_secs, 300);
        assert_eq!(loaded.debounce_secs, 15);
        assert!(!loaded.owner.is_empty());
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = SyncConfig::new("/data/docs", "/Sites/docs");
        config.save(&path).unwrap();
        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.remote_root, config.remote_root);
    }
}
