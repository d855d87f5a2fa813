//! Updater Configuration Module
//! Handles loading and validating the updater's JSON configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Bytes per read while hashing and backing up the partition
    pub chunk_size: usize,
    /// Filesystem type of the backup image
    pub backup_fs_type: String,
    /// Where the system partition is mounted; looked up in `mounts_table` when unset
    pub mount_point: Option<PathBuf>,
    pub mounts_table: PathBuf,
    /// Leave mounts in place after a failure for inspection
    pub keep_mounts_on_failure: bool,
    /// Remount the system partition read-only after teardown
    pub restore_read_only: bool,
    /// Net growth allowed between free-space checks in shadow fallback mode
    pub shadow_growth_budget: u64,
    pub scratch_system_name: String,
    pub scratch_backup_name: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            backup_fs_type: "ext4".to_string(),
            mount_point: None,
            mounts_table: PathBuf::from("/proc/mounts"),
            keep_mounts_on_failure: false,
            restore_read_only: true,
            shadow_growth_budget: 64 * 1024 * 1024,
            scratch_system_name: "system".to_string(),
            scratch_backup_name: "backup".to_string(),
        }
    }
}

impl UpdaterConfig {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.to_path_buf()));
        }
        let content = std::fs::read_to_string(config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "must be greater than zero".into(),
            });
        }
        for (field, name) in [
            ("scratch_system_name", &self.scratch_system_name),
            ("scratch_backup_name", &self.scratch_backup_name),
        ] {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{:?} is not a plain directory name", name),
                });
            }
        }
        if self.scratch_system_name == self.scratch_backup_name {
            return Err(ConfigError::Invalid {
                field: "scratch_backup_name",
                reason: "must differ from scratch_system_name".into(),
            });
        }
        Ok(())
    }
}
