use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::BackupError;
use crate::types::LOCK_STALE_AFTER;

/// File name of the advisory lock inside a snapshot directory.
pub const LOCK_FILE: &str = "backup.lock";

/// Advisory backup lock. The lock file is removed when dropped.
#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release backup lock");
            }
        }
    }
}

/// Try to take the lock in `dir`. Returns `None` if another holder has a
/// fresh lock; a lock older than the staleness window is reclaimed.
pub fn obtain_lock(dir: &Path) -> Result<Option<BackupLock>, BackupError> {
    obtain_lock_with(dir, LOCK_STALE_AFTER)
}

pub(crate) fn obtain_lock_with(
    dir: &Path,
    stale_after: Duration,
) -> Result<Option<BackupLock>, BackupError> {
    let path = dir.join(LOCK_FILE);
    if try_create(&path)? {
        return Ok(Some(BackupLock { path }));
    }

    let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        // Released between our attempt and the stat.
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(try_create(&path)?.then(|| BackupLock { path }));
        }
        Err(e) => return Err(BackupError::io(&path, e)),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age <= stale_after {
        return Ok(None);
    }

    debug!(path = %path.display(), age_secs = age.as_secs(), "reclaiming stale backup lock");
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(BackupError::io(&path, e)),
    }
    Ok(try_create(&path)?.then(|| BackupLock { path }))
}

fn try_create(path: &Path) -> Result<bool, BackupError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(BackupError::io(path, e)),
    }
}
