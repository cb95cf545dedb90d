use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::BackupMode;
use crate::error::BackupError;
use crate::storage::PageFile;

use super::object::sha1_hex;
use super::write_atomic;
use super::object_storage::{ObjectStorage, StorageClass};

/// Archive key for a full backup taken at `timestamp`.
pub fn archive_key(tenant: &str, branch: &str, timestamp: i64) -> String {
    let identity = format!("{tenant}-{branch}-{timestamp}");
    format!("{}.db.gz", sha1_hex(identity.as_bytes()))
}

/// Identifies one full-backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBackupHandle {
    pub tenant: String,
    pub branch: String,
    pub timestamp: i64,
    pub key: String,
    /// Compressed size in bytes; zero in testing mode.
    pub size: u64,
}

impl FullBackupHandle {
    /// Rebuild a handle for an archive taken at `timestamp`.
    pub fn new(tenant: &str, branch: &str, timestamp: i64) -> Self {
        Self {
            tenant: tenant.to_string(),
            branch: branch.to_string(),
            timestamp,
            key: archive_key(tenant, branch, timestamp),
            size: 0,
        }
    }
}

/// Whole-file gzip archives of tenant databases.
#[derive(Debug, Clone)]
pub struct FullBackup {
    mode: BackupMode,
    storage: Option<Arc<dyn ObjectStorage>>,
}

impl FullBackup {
    pub fn new(mode: BackupMode, storage: Option<Arc<dyn ObjectStorage>>) -> Self {
        Self { mode, storage }
    }

    pub fn mode(&self) -> &BackupMode {
        &self.mode
    }

    fn remote(&self) -> Result<&Arc<dyn ObjectStorage>, BackupError> {
        self.storage
            .as_ref()
            .ok_or_else(|| BackupError::ObjectStorage("no object storage configured".into()))
    }

    /// Archive the database file at `database`.
    pub fn run(
        &self,
        tenant: &str,
        branch: &str,
        database: &Path,
    ) -> Result<FullBackupHandle, BackupError> {
        self.run_at(tenant, branch, database, Utc::now())
    }

    pub fn run_at(
        &self,
        tenant: &str,
        branch: &str,
        database: &Path,
        at: DateTime<Utc>,
    ) -> Result<FullBackupHandle, BackupError> {
        let mut handle = FullBackupHandle::new(tenant, branch, at.timestamp());
        if self.mode == BackupMode::Testing {
            return Ok(handle);
        }

        let archive = compress(database)?;
        handle.size = archive.len() as u64;

        match &self.mode {
            BackupMode::Local { dir } => {
                std::fs::create_dir_all(dir).map_err(|e| BackupError::io(dir, e))?;
                let path = dir.join(&handle.key);
                write_atomic(&path, &archive)?;
            }
            BackupMode::Remote { bucket } => {
                self.remote()?
                    .put(bucket, &handle.key, &archive, StorageClass::StandardIa)?;
            }
            BackupMode::Testing => {}
        }

        info!(tenant, branch, key = %handle.key, size = handle.size, "full backup written");
        Ok(handle)
    }

    pub fn delete(&self, handle: &FullBackupHandle) -> Result<(), BackupError> {
        match &self.mode {
            BackupMode::Local { dir } => {
                let path = dir.join(&handle.key);
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(BackupError::io(&path, e)),
                }
            }
            BackupMode::Remote { bucket } => self.remote()?.delete(bucket, &handle.key),
            BackupMode::Testing => Ok(()),
        }
    }

    /// Archive size in bytes, zero if it does not exist.
    pub fn size(&self, handle: &FullBackupHandle) -> Result<u64, BackupError> {
        match &self.mode {
            BackupMode::Local { dir } => {
                let path = dir.join(&handle.key);
                match std::fs::metadata(&path) {
                    Ok(meta) => Ok(meta.len()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
                    Err(e) => Err(BackupError::io(&path, e)),
                }
            }
            BackupMode::Remote { bucket } => {
                Ok(self.remote()?.size(bucket, &handle.key)?.unwrap_or(0))
            }
            BackupMode::Testing => Ok(0),
        }
    }

    /// Inflate an archive into `dest`, replacing it. Returns the number of
    /// bytes written.
    pub fn restore(&self, handle: &FullBackupHandle, dest: &Path) -> Result<u64, BackupError> {
        let archive = match &self.mode {
            BackupMode::Local { dir } => {
                let path = dir.join(&handle.key);
                match std::fs::read(&path) {
                    Ok(bytes) => Some(bytes),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => return Err(BackupError::io(&path, e)),
                }
            }
            BackupMode::Remote { bucket } => self.remote()?.get(bucket, &handle.key)?,
            BackupMode::Testing => None,
        };
        let archive = archive.ok_or_else(|| BackupError::NotFound(handle.key.clone()))?;

        let mut bytes = Vec::new();
        GzDecoder::new(archive.as_slice())
            .read_to_end(&mut bytes)
            .map_err(|e| BackupError::InvalidObject(format!("{}: {e}", handle.key)))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        write_atomic(dest, &bytes)?;
        info!(key = %handle.key, dest = %dest.display(), bytes = bytes.len(), "full backup restored");
        Ok(bytes.len() as u64)
    }
}

/// Gzip the database file while holding a shared lock on it, so no
/// checkpoint rewrites pages mid-read.
fn compress(database: &Path) -> Result<Vec<u8>, BackupError> {
    let file = match PageFile::open(database, false) {
        Ok(file) => file,
        Err(crate::error::StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            return Err(BackupError::NotFound(database.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let _lock = file.lock_shared()?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut reader: &File = file.file();
    io::copy(&mut reader, &mut encoder).map_err(|e| BackupError::io(database, e))?;
    encoder.flush().map_err(|e| BackupError::io(database, e))?;
    encoder.finish().map_err(|e| BackupError::io(database, e))
}
