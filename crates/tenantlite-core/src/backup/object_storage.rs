use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::BackupError;

use super::write_atomic;

/// Storage class requested for an uploaded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    /// Infrequent-access cold storage.
    StandardIa,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::StandardIa => "STANDARD_IA",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bucket/key blob store.
pub trait ObjectStorage: Send + Sync + fmt::Debug {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        storage_class: StorageClass,
    ) -> Result<(), BackupError>;

    /// Fetch an object, `None` if absent.
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, BackupError>;

    /// Delete an object. Deleting a missing object succeeds.
    fn delete(&self, bucket: &str, key: &str) -> Result<(), BackupError>;

    /// Size in bytes, `None` if absent.
    fn size(&self, bucket: &str, key: &str) -> Result<Option<u64>, BackupError>;
}

/// Buckets as directories under a root. Storage classes are accepted and
/// ignored.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf, BackupError> {
        let plain = |s: &str| !s.is_empty() && !s.contains(['/', '\\']) && s != "." && s != "..";
        if !plain(bucket) || !plain(key) {
            return Err(BackupError::ObjectStorage(format!(
                "invalid object location {bucket}/{key}"
            )));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        _storage_class: StorageClass,
    ) -> Result<(), BackupError> {
        let path = self.path(bucket, key)?;
        let dir = self.root.join(bucket);
        std::fs::create_dir_all(&dir).map_err(|e| BackupError::io(&dir, e))?;
        write_atomic(&path, bytes)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, BackupError> {
        let path = self.path(bucket, key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io(&path, e)),
        }
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), BackupError> {
        let path = self.path(bucket, key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::io(&path, e)),
        }
    }

    fn size(&self, bucket: &str, key: &str) -> Result<Option<u64>, BackupError> {
        let path = self.path(bucket, key)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io(&path, e)),
        }
    }
}
