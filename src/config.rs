//! Configuration for elohim-user-store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::StoreError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-user-store")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the backend files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Which persistence backend to open
    #[serde(default)]
    pub backend: BackendKind,

    /// Upper bound for a single backend call, in seconds
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    /// Upper bound for a profile provider lookup, in seconds
    #[serde(default = "default_profile_timeout")]
    pub profile_timeout_secs: u64,

    /// Name given to new records when the profile provider has none
    #[serde(default = "default_name")]
    pub default_name: String,
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_profile_timeout() -> u64 {
    10
}

fn default_name() -> String {
    "User".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            backend: BackendKind::default(),
            backend_timeout_secs: default_backend_timeout(),
            profile_timeout_secs: default_profile_timeout(),
            default_name: default_name(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn profile_timeout(&self) -> Duration {
        Duration::from_secs(self.profile_timeout_secs)
    }

    /// Flat-file backend path
    pub fn users_json_path(&self) -> PathBuf {
        self.storage_dir.join("usersData.json")
    }

    /// Document backend path
    pub fn users_sled_path(&self) -> PathBuf {
        self.storage_dir.join("users.sled")
    }

    /// Relational backend path
    pub fn users_db_path(&self) -> PathBuf {
        self.storage_dir.join("users.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("backend = \"relational\"").unwrap();
        assert_eq!(config.backend, BackendKind::Relational);
        assert_eq!(config.backend_timeout_secs, 30);
        assert_eq!(config.default_name, "User");
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            storage_dir: temp_dir.path().to_path_buf(),
            backend: BackendKind::Document,
            ..Default::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.backend, BackendKind::Document);
        assert_eq!(loaded.storage_dir, temp_dir.path());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "backend = 42").unwrap();
        assert!(matches!(Config::load(&path), Err(StoreError::Config(_))));
    }
}
