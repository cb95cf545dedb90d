//! Incremental and full backups.
//!
//! Incremental backups turn each checkpoint's changed pages into
//! content-addressed objects, a deduplicated commit, and a line in the
//! day's head. Full backups gzip the whole database file.

pub mod commit;
pub mod full;
pub mod head;
pub mod incremental;
pub mod lock;
pub mod object;
pub mod object_storage;
pub mod restore;
pub mod snapshot;

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, NaiveTime, Utc};
use tempfile::NamedTempFile;

use crate::error::BackupError;

pub use commit::Commit;
pub use full::{FullBackup, FullBackupHandle, archive_key};
pub use head::Head;
pub use incremental::BackupEngine;
pub use lock::{BackupLock, obtain_lock};
pub use object::{ObjectStore, sha1_hex};
pub use object_storage::{LocalObjectStorage, ObjectStorage, StorageClass};
pub use restore::{RestoreSummary, Restorer};
pub use snapshot::{Snapshot, list_snapshots};

/// UTC midnight of the day containing `at`, in epoch seconds.
pub fn utc_day(at: DateTime<Utc>) -> i64 {
    at.date_naive().and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Write `bytes` to a temp file beside `path`, sync it, then rename it
/// over `path`. Readers see either the old file or the complete new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackupError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| BackupError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| BackupError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| BackupError::io(path, e))?;
    tmp.persist(path).map_err(|e| BackupError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7");
        std::fs::write(&path, b"torn").unwrap();

        write_atomic(&path, b"complete page").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"complete page");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_missing_dir_is_io_error() {
        let dir = tempdir().unwrap();
        match write_atomic(&dir.path().join("nope/7"), b"x") {
            Err(BackupError::Io { .. }) => {}
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_utc_day_truncates() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 12).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(utc_day(at), midnight.timestamp());
        assert_eq!(utc_day(midnight), midnight.timestamp());
    }
}
