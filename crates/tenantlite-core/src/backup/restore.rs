use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BackupError;
use crate::storage::PageFile;

use super::snapshot::{Snapshot, list_snapshots};

/// Outcome of a point-in-time restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub snapshots: usize,
    pub pages: usize,
    /// Day of the newest snapshot applied.
    pub restored_to: i64,
}

/// Rebuilds database files from incremental snapshots.
#[derive(Debug, Clone)]
pub struct Restorer {
    backup_dir: PathBuf,
}

impl Restorer {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    /// Replay every snapshot of the branch whose day is at or before
    /// `timestamp`, oldest first, onto `dest`, then trim `dest` to the page
    /// count its header declares.
    ///
    /// Granularity is one UTC day: a page file holds the page as of the last
    /// backup of its day, so the day containing `timestamp` is restored as
    /// of its last backup, including changes made after `timestamp`.
    ///
    /// Only pages that changed are backed up, so the result is complete only
    /// when snapshots cover the database since it was created.
    pub fn restore_to(
        &self,
        tenant: &str,
        branch: &str,
        timestamp: i64,
        dest: &Path,
    ) -> Result<RestoreSummary, BackupError> {
        let days: Vec<i64> = list_snapshots(&self.backup_dir, tenant, branch)?
            .into_iter()
            .filter(|&day| day <= timestamp)
            .collect();
        let Some(&restored_to) = days.last() else {
            return Err(BackupError::NotFound(format!(
                "no snapshot of {tenant}/{branch} at or before {timestamp}"
            )));
        };

        let file = PageFile::open(dest, true)?;
        file.set_len(0)?;
        let mut pages = 0;
        for &day in &days {
            let snapshot = Snapshot::new(&self.backup_dir, tenant, branch, day);
            let numbers = snapshot.page_numbers()?;
            for (page_number, data) in snapshot.read_pages(&numbers)? {
                file.write_page(page_number, &data)?;
                pages += 1;
            }
        }

        if let Some(header) = file.header()?.filter(|h| h.total_pages > 0) {
            file.set_len(header.database_size())?;
        }
        file.sync()?;

        info!(
            tenant,
            branch,
            snapshots = days.len(),
            pages,
            dest = %dest.display(),
            "restore complete"
        );
        Ok(RestoreSummary {
            snapshots: days.len(),
            pages,
            restored_to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupEngine;
    use crate::storage::DatabaseHeader;
    use crate::types::{ChangedPages, HEADER_SIZE};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    const PS: usize = 512;

    fn header_page(total_pages: u32) -> Vec<u8> {
        let mut page = vec![0u8; PS];
        let mut header = DatabaseHeader::new(PS as u32);
        header.total_pages = total_pages;
        header.write_to(&mut page);
        page
    }

    #[test]
    fn test_replays_days_in_order() {
        let dir = tempdir().unwrap();
        let day0 = Snapshot::new(dir.path(), "acme", "main", 0);
        day0.create().unwrap();
        day0.write_page(0, &header_page(3)).unwrap();
        day0.write_page(1, &[1u8; PS]).unwrap();
        day0.write_page(2, &[1u8; PS]).unwrap();

        let day1 = Snapshot::new(dir.path(), "acme", "main", 86400);
        day1.create().unwrap();
        day1.write_page(2, &[2u8; PS]).unwrap();

        let restorer = Restorer::new(dir.path());
        let dest = dir.path().join("restored.db");

        let summary = restorer.restore_to("acme", "main", 86400 + 5, &dest).unwrap();
        assert_eq!(summary.snapshots, 2);
        assert_eq!(summary.pages, 4);
        assert_eq!(summary.restored_to, 86400);

        let file = PageFile::open(&dest, false).unwrap();
        assert_eq!(file.len().unwrap(), 3 * PS as u64);
        assert_eq!(file.read_page(2, PS as u32).unwrap(), vec![2u8; PS]);

        // Restoring to the first day ignores later snapshots.
        restorer.restore_to("acme", "main", 100, &dest).unwrap();
        let file = PageFile::open(&dest, false).unwrap();
        assert_eq!(file.read_page(2, PS as u32).unwrap(), vec![1u8; PS]);
    }

    #[test]
    fn test_restore_granularity_is_one_day() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        let morning = Utc.timestamp_opt(86400 + 3600, 0).unwrap();
        let evening = Utc.timestamp_opt(86400 + 72000, 0).unwrap();
        let page = |fill: u8| -> ChangedPages {
            let mut first = header_page(2);
            first[HEADER_SIZE..].fill(fill);
            [(0, first), (1, vec![fill; PS])].into_iter().collect()
        };
        engine.run_incremental_backup_at("acme", "main", &page(1), morning).unwrap();
        engine.run_incremental_backup_at("acme", "main", &page(2), evening).unwrap();

        let restorer = Restorer::new(dir.path());
        let dest = dir.path().join("restored.db");
        let summary = restorer
            .restore_to("acme", "main", morning.timestamp(), &dest)
            .unwrap();
        assert_eq!(summary.restored_to, 86400);
        let file = PageFile::open(&dest, false).unwrap();
        assert_eq!(file.read_page(1, PS as u32).unwrap(), vec![2u8; PS]);

        // The previous day's end excludes the whole day.
        match restorer.restore_to("acme", "main", 86399, &dest) {
            Err(BackupError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_truncates_to_header_page_count() {
        let dir = tempdir().unwrap();
        let day0 = Snapshot::new(dir.path(), "acme", "main", 0);
        day0.create().unwrap();
        day0.write_page(0, &header_page(4)).unwrap();
        for n in 1..4 {
            day0.write_page(n, &[n as u8; PS]).unwrap();
        }
        let day1 = Snapshot::new(dir.path(), "acme", "main", 86400);
        day1.create().unwrap();
        day1.write_page(0, &header_page(2)).unwrap();

        let dest = dir.path().join("restored.db");
        Restorer::new(dir.path())
            .restore_to("acme", "main", 86400, &dest)
            .unwrap();
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 2 * PS as u64);
    }

    #[test]
    fn test_no_snapshot_is_not_found() {
        let dir = tempdir().unwrap();
        let restorer = Restorer::new(dir.path());
        match restorer.restore_to("acme", "main", 0, &dir.path().join("x.db")) {
            Err(BackupError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
