use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::error::BackupError;
use crate::types::ChangedPages;

use super::commit::Commit;
use super::lock::obtain_lock;
use super::snapshot::Snapshot;
use super::utc_day;

/// Persists checkpointed pages as content-addressed incremental backups.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    backup_dir: PathBuf,
}

impl BackupEngine {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// The snapshot for the day containing `at`, with its directory created.
    pub fn create_snapshot(
        &self,
        tenant: &str,
        branch: &str,
        at: DateTime<Utc>,
    ) -> Result<Snapshot, BackupError> {
        let snapshot = Snapshot::new(&self.backup_dir, tenant, branch, utc_day(at));
        snapshot.create()?;
        Ok(snapshot)
    }

    /// Back up `changed_pages` into today's snapshot.
    pub fn run_incremental_backup(
        &self,
        tenant: &str,
        branch: &str,
        changed_pages: &ChangedPages,
    ) -> Result<Option<Commit>, BackupError> {
        self.run_incremental_backup_at(tenant, branch, changed_pages, Utc::now())
    }

    /// Back up `changed_pages` as of `at`: every page becomes an object and
    /// a numbered restore file, the object hashes become one commit, and
    /// the commit is appended to the snapshot's head. Returns `None` when
    /// there is nothing to back up or another backup holds the snapshot's
    /// lock; the pages are already in the database file either way.
    pub fn run_incremental_backup_at(
        &self,
        tenant: &str,
        branch: &str,
        changed_pages: &ChangedPages,
        at: DateTime<Utc>,
    ) -> Result<Option<Commit>, BackupError> {
        if changed_pages.is_empty() {
            return Ok(None);
        }

        let snapshot = self.create_snapshot(tenant, branch, at)?;
        let Some(_lock) = obtain_lock(snapshot.dir())? else {
            debug!(
                tenant,
                branch,
                snapshot = snapshot.timestamp,
                pages = changed_pages.len(),
                "backup in progress, skipping"
            );
            return Ok(None);
        };

        let result = self.write_commit(&snapshot, changed_pages, at.timestamp());
        match &result {
            Ok(commit) => info!(
                tenant,
                branch,
                snapshot = snapshot.timestamp,
                commit = %commit.hash,
                pages = changed_pages.len(),
                "incremental backup written"
            ),
            Err(e) => error!(
                fatal = true,
                tenant,
                branch,
                snapshot = snapshot.timestamp,
                error = %e,
                "incremental backup failed"
            ),
        }
        result.map(Some)
    }

    fn write_commit(
        &self,
        snapshot: &Snapshot,
        changed_pages: &ChangedPages,
        now: i64,
    ) -> Result<Commit, BackupError> {
        let mut hashes = Vec::with_capacity(changed_pages.len());
        for (&page_number, data) in changed_pages {
            hashes.push(snapshot.objects().write(data)?);
            snapshot.write_page(page_number, data)?;
        }
        let commit = Commit::new(snapshot.timestamp, now, hashes);
        commit.save(snapshot.objects())?;
        if !snapshot.head().append(&commit.hash)? {
            debug!(commit = %commit.hash, "commit already at head");
        }
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::lock::LOCK_FILE;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pages(list: &[(u32, u8)]) -> ChangedPages {
        list.iter().map(|&(n, b)| (n, vec![b; 512])).collect()
    }

    #[test]
    fn test_empty_changes_write_nothing() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        let commit = engine
            .run_incremental_backup("acme", "main", &ChangedPages::new())
            .unwrap();
        assert!(commit.is_none());
        assert!(!dir.path().join("acme").exists());
    }

    #[test]
    fn test_single_page_backup() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        let now = at(1_700_000_123);

        let snapshot = Snapshot::new(dir.path(), "acme", "main", utc_day(now));
        assert!(snapshot.head().commits().unwrap().is_empty());

        let commit = engine
            .run_incremental_backup_at("acme", "main", &pages(&[(2, 0xAA)]), now)
            .unwrap()
            .unwrap();

        assert_eq!(commit.object_hashes.len(), 1);
        assert_eq!(commit.timestamp, 1_699_920_000);
        assert_eq!(commit.commit_timestamp, 1_700_000_123);
        assert!(snapshot.objects().contains(&commit.object_hashes[0]));
        assert!(snapshot.objects().contains(&commit.hash));
        assert_eq!(snapshot.head().commits().unwrap(), vec![commit.hash.clone()]);
        assert_eq!(snapshot.read_page(2).unwrap(), vec![0xAA; 512]);
        // Lock released.
        assert!(!snapshot.dir().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_repeated_backup_does_not_duplicate_head() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        let now = at(1_700_000_000);
        let changed = pages(&[(0, 1), (1, 2)]);

        let a = engine
            .run_incremental_backup_at("acme", "main", &changed, now)
            .unwrap()
            .unwrap();
        let b = engine
            .run_incremental_backup_at("acme", "main", &changed, at(1_700_000_500))
            .unwrap()
            .unwrap();
        assert_eq!(a.hash, b.hash);

        let snapshot = Snapshot::new(dir.path(), "acme", "main", utc_day(now));
        assert_eq!(snapshot.head().commits().unwrap().len(), 1);

        engine
            .run_incremental_backup_at("acme", "main", &pages(&[(1, 3)]), now)
            .unwrap();
        assert_eq!(snapshot.head().commits().unwrap().len(), 2);
        assert_eq!(snapshot.read_page(1).unwrap(), vec![3; 512]);
    }

    #[test]
    fn test_held_lock_skips_backup() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        let now = at(1_700_000_000);
        let snapshot = engine.create_snapshot("acme", "main", now).unwrap();
        let held = obtain_lock(snapshot.dir()).unwrap().unwrap();

        let commit = engine
            .run_incremental_backup_at("acme", "main", &pages(&[(0, 1)]), now)
            .unwrap();
        assert!(commit.is_none());
        assert!(snapshot.head().commits().unwrap().is_empty());
        assert!(snapshot.page_numbers().unwrap().is_empty());
        // The other holder's lock is left alone.
        assert!(snapshot.dir().join(LOCK_FILE).exists());

        drop(held);
        assert!(
            engine
                .run_incremental_backup_at("acme", "main", &pages(&[(0, 1)]), now)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_identical_pages_share_object() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        let commit = engine
            .run_incremental_backup_at("acme", "main", &pages(&[(0, 9), (5, 9)]), at(0))
            .unwrap()
            .unwrap();
        assert_eq!(commit.object_hashes.len(), 1);
    }

    #[test]
    fn test_days_use_separate_snapshots() {
        let dir = tempdir().unwrap();
        let engine = BackupEngine::new(dir.path());
        engine
            .run_incremental_backup_at("acme", "main", &pages(&[(0, 1)]), at(100))
            .unwrap();
        engine
            .run_incremental_backup_at("acme", "main", &pages(&[(0, 2)]), at(86_400 + 100))
            .unwrap();
        assert!(dir.path().join("acme/main/0/head").exists());
        assert!(dir.path().join("acme/main/86400/head").exists());
    }
}
