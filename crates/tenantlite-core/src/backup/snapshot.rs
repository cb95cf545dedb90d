use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::BackupError;
use crate::types::PageNumber;

use super::head::Head;
use super::write_atomic;
use super::object::ObjectStore;

/// Upper bound on threads reading restore files for one snapshot.
pub const MAX_READERS: usize = 8;

/// One tenant branch's backup for one UTC day.
///
/// ```text
/// <backup_dir>/<tenant>/<branch>/<day_epoch>/
///     head
///     objects/<hash[0:2]>/<hash[2:]>
///     <page_number>
///     backup.lock
/// ```
#[derive(Debug)]
pub struct Snapshot {
    pub tenant: String,
    pub branch: String,
    /// UTC midnight of the day, in epoch seconds.
    pub timestamp: i64,
    dir: PathBuf,
    objects: ObjectStore,
}

impl Snapshot {
    pub fn new(backup_dir: &Path, tenant: &str, branch: &str, timestamp: i64) -> Self {
        let dir = branch_dir(backup_dir, tenant, branch).join(timestamp.to_string());
        let objects = ObjectStore::new(dir.join("objects"));
        Self {
            tenant: tenant.to_string(),
            branch: branch.to_string(),
            timestamp,
            dir,
            objects,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn head(&self) -> Head {
        Head::new(self.dir.join("head"))
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Create the snapshot directory if it does not exist yet.
    pub fn create(&self) -> Result<(), BackupError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| BackupError::io(&self.dir, e))
    }

    pub fn page_path(&self, page_number: PageNumber) -> PathBuf {
        self.dir.join(page_number.to_string())
    }

    /// Write the latest content of a page as a numbered restore file.
    pub fn write_page(&self, page_number: PageNumber, data: &[u8]) -> Result<(), BackupError> {
        write_atomic(&self.page_path(page_number), data)
    }

    pub fn read_page(&self, page_number: PageNumber) -> Result<Vec<u8>, BackupError> {
        let path = self.page_path(page_number);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BackupError::NotFound(format!(
                "page {page_number} in snapshot {}",
                self.timestamp
            ))),
            Err(e) => Err(BackupError::io(&path, e)),
        }
    }

    /// Page numbers that have a restore file, ascending.
    pub fn page_numbers(&self) -> Result<Vec<PageNumber>, BackupError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io(&self.dir, e)),
        };
        let mut pages = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(&self.dir, e))?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<PageNumber>().ok())
            {
                pages.push(n);
            }
        }
        pages.sort_unstable();
        Ok(pages)
    }

    /// Read restore files concurrently on at most [`MAX_READERS`] scoped
    /// threads, each taking a contiguous share of `page_numbers`.
    pub fn read_pages(
        &self,
        page_numbers: &[PageNumber],
    ) -> Result<BTreeMap<PageNumber, Vec<u8>>, BackupError> {
        if page_numbers.is_empty() {
            return Ok(BTreeMap::new());
        }
        let workers = std::thread::available_parallelism()
            .map_or(1, |n| n.get())
            .clamp(1, MAX_READERS);
        let chunk = page_numbers.len().div_ceil(workers);

        let pages = Mutex::new(BTreeMap::new());
        let results: Vec<Result<(), BackupError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = page_numbers
                .chunks(chunk)
                .map(|share| {
                    let pages = &pages;
                    scope.spawn(move || {
                        for &page_number in share {
                            let data = self.read_page(page_number)?;
                            pages.lock().insert(page_number, data);
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(BackupError::InvalidObject("page reader panicked".into()))
                    })
                })
                .collect()
        });
        for result in results {
            result?;
        }
        Ok(pages.into_inner())
    }
}

pub(crate) fn branch_dir(backup_dir: &Path, tenant: &str, branch: &str) -> PathBuf {
    backup_dir.join(tenant).join(branch)
}

/// Day timestamps of every snapshot of a tenant branch, ascending.
pub fn list_snapshots(
    backup_dir: &Path,
    tenant: &str,
    branch: &str,
) -> Result<Vec<i64>, BackupError> {
    let dir = branch_dir(backup_dir, tenant, branch);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::io(&dir, e)),
    };
    let mut days = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io(&dir, e))?;
        if let Some(day) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i64>().ok())
        {
            days.push(day);
        }
    }
    days.sort_unstable();
    Ok(days)
}
