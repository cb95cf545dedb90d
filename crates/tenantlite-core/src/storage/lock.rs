use std::fs::File;

use fs2::FileExt;

use crate::error::StorageError;

/// An advisory `flock(2)` held on a database file.
///
/// Checkpoints hold the exclusive lock while flushing pages; full backups
/// hold the shared lock while archiving, so an archive never observes a
/// half-written checkpoint. The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire an exclusive lock, blocking until it is available.
    pub fn exclusive(file: &File) -> Result<Self, StorageError> {
        let file = file.try_clone()?;
        file.lock_exclusive().map_err(|_| StorageError::FileLocked)?;
        Ok(Self { file })
    }

    /// Acquire a shared lock, blocking until it is available.
    pub fn shared(file: &File) -> Result<Self, StorageError> {
        let file = file.try_clone()?;
        file.lock_shared().map_err(|_| StorageError::FileLocked)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
