//! Engine configuration: loaded from a JSON file on disk, overlaid with
//! environment variables, per spec §6.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_URL: &str = "https://stab.digitmi.de";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionPolicy {
    RemoteWins,
    LocalWins,
    Merge,
}

impl Default for ConflictResolutionPolicy {
    fn default() -> Self {
        ConflictResolutionPolicy::RemoteWins
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub sync_db_path: PathBuf,
    pub server_url: String,
    pub sync_interval: u64,
    pub batch_size: i64,
    pub compression: bool,
    pub encryption: bool,
    pub conflict_resolution: ConflictResolutionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/stabsstelle/stabsstelle.db"),
            sync_db_path: PathBuf::from("/var/lib/stabsstelle/sync_meta.db"),
            server_url: DEFAULT_SERVER_URL.to_string(),
            sync_interval: 900,
            batch_size: 100,
            compression: true,
            encryption: false,
            conflict_resolution: ConflictResolutionPolicy::RemoteWins,
        }
    }
}

impl EngineConfig {
    /// Load the config file at `path`, falling back to defaults if it does
    /// not exist, then overlay recognized environment variables.
    ///
    /// An existing-but-unparseable file is `ConfigInvalid`; a missing file
    /// is not an error (per spec §6, defaults apply).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| SyncError::ConfigInvalid(format!("{}: {e}", path.display())))?
        } else {
            EngineConfig::default()
        };

        if let Ok(server_url) = std::env::var("SYNC_SERVER_URL") {
            config.server_url = server_url;
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Resolve the config directory: `--config-dir` / `$STABCTL_CONFIG_DIR` if
/// set, else the platform config dir joined with `stabsstelle`, else
/// `/etc/stabsstelle` to match the original deployment's default.
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STABCTL_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|d| d.join("stabsstelle"))
        .unwrap_or_else(|| PathBuf::from("/etc/stabsstelle"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = EngineConfig::load(Path::new("/nonexistent/path/sync_config.json")).unwrap();
        assert_eq!(config.sync_interval, 900);
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn malformed_file_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_config.json");
        std::fs::write(&path, "not json").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, SyncError::ConfigInvalid(_)));
    }

    #[test]
    fn env_var_overrides_server_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_config.json");
        // SAFETY: test runs single-threaded within this process for this var.
        unsafe { std::env::set_var("SYNC_SERVER_URL", "https://override.example") };
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.server_url, "https://override.example");
        unsafe { std::env::remove_var("SYNC_SERVER_URL") };
    }
}
