//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FieldError, ValidationError};
use crate::types::{DEFAULT_PAGE_SIZE, is_valid_page_size};

/// Where full backups are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackupMode {
    /// Archives are written under a local directory.
    Local { dir: PathBuf },
    /// Archives are uploaded to a bucket through the configured object
    /// storage.
    Remote { bucket: String },
    /// No archive is written; every operation reports zero size.
    Testing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root of tenant database storage.
    pub data_dir: PathBuf,
    /// Journals and temp files.
    pub scratch_dir: PathBuf,
    /// Root of incremental snapshots.
    pub backup_dir: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
    pub backup_mode: BackupMode,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_statement_cache_capacity() -> usize {
    64
}

impl Config {
    /// A configuration with every directory laid out below `root` and full
    /// backups kept locally.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            scratch_dir: root.join("scratch"),
            backup_dir: root.join("backups"),
            page_size: default_page_size(),
            statement_cache_capacity: default_statement_cache_capacity(),
            backup_mode: BackupMode::Local {
                dir: root.join("full-backups"),
            },
        }
    }

    pub fn with_backup_mode(mut self, mode: BackupMode) -> Self {
        self.backup_mode = mode;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        if !is_valid_page_size(self.page_size) {
            errors.push(FieldError {
                field: "page_size".into(),
                message: format!("{} is not a power of two in 512..=65536", self.page_size),
            });
        }
        if self.statement_cache_capacity == 0 {
            errors.push(FieldError {
                field: "statement_cache_capacity".into(),
                message: "must be at least 1".into(),
            });
        }
        if let BackupMode::Remote { bucket } = &self.backup_mode {
            if bucket.is_empty() {
                errors.push(FieldError {
                    field: "backup_mode.bucket".into(),
                    message: "must not be empty".into(),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = Config::new("/srv/tl");
        assert_eq!(config.data_dir, PathBuf::from("/srv/tl/data"));
        assert_eq!(config.backup_dir, PathBuf::from("/srv/tl/backups"));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::new("/srv/tl")
            .with_page_size(1000)
            .with_backup_mode(BackupMode::Remote {
                bucket: String::new(),
            });
        config.statement_cache_capacity = 0;

        let err = config.validate().unwrap_err();
        let fields: Vec<_> = err.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["page_size", "statement_cache_capacity", "backup_mode.bucket"]
        );
    }

    #[test]
    fn test_deserialize_backup_mode() {
        let json = r#"{
            "data_dir": "/d", "scratch_dir": "/s", "backup_dir": "/b",
            "backup_mode": {"mode": "remote", "bucket": "archive"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.backup_mode,
            BackupMode::Remote {
                bucket: "archive".into()
            }
        );
        assert_eq!(config.statement_cache_capacity, 64);

        let testing: BackupMode = serde_json::from_str(r#"{"mode": "testing"}"#).unwrap();
        assert_eq!(testing, BackupMode::Testing);
    }
}
