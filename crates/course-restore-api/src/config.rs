use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKUP_ROOT: &str = "BackupFiles/Backup";
pub const DEFAULT_DB_PATH: &str = "./course_restore.sqlite3";

/// Settings for one restore run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreConfig {
    pub backup_root: PathBuf,
    pub db_path: PathBuf,
    /// Seed the run checkpoint from the durable ledger.
    pub resume: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from(DEFAULT_BACKUP_ROOT),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            resume: false,
        }
    }
}

impl RestoreConfig {
    /// Read a YAML config file. Keys left out keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid config YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `raw` is not valid config YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("failed to parse restore config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() -> Result<()> {
        let config = RestoreConfig::from_yaml("backup_root: /srv/backups\n")?;
        assert_eq!(config.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert!(!config.resume);

        assert_eq!(RestoreConfig::from_yaml("")?, RestoreConfig::default());
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RestoreConfig::from_yaml("backup_dir: /tmp\n").is_err());
    }

    #[test]
    fn load_reads_every_key_from_disk() -> Result<()> {
        let path =
            std::env::temp_dir().join(format!("course-restore-config-{}.yaml", ulid::Ulid::new()));
        fs::write(&path, "backup_root: shards\ndb_path: restore.sqlite3\nresume: true\n")?;

        let config = RestoreConfig::load(&path)?;
        assert_eq!(config.backup_root, PathBuf::from("shards"));
        assert_eq!(config.db_path, PathBuf::from("restore.sqlite3"));
        assert!(config.resume);

        fs::remove_file(&path)?;
        Ok(())
    }
}
