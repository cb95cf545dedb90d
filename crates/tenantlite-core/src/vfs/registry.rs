use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::storage::PageFile;

/// Process-wide cache of open file handles, keyed by resolved path.
///
/// Repeated opens of the same path return the same `PageFile`. Each open is
/// recorded against its owner (a connection's VFS id) so that closing a
/// connection drops every handle it opened.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    files: Mutex<HashMap<PathBuf, Arc<PageFile>>>,
    owners: Mutex<HashMap<u64, HashSet<PathBuf>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `path`, opening it on first use.
    pub fn open(
        &self,
        owner: u64,
        path: &Path,
        create: bool,
    ) -> Result<Arc<PageFile>, StorageError> {
        let file = {
            let mut files = self.files.lock();
            match files.get(path) {
                Some(file) => Arc::clone(file),
                None => {
                    let file = Arc::new(PageFile::open(path, create)?);
                    files.insert(path.to_path_buf(), Arc::clone(&file));
                    file
                }
            }
        };
        self.owners
            .lock()
            .entry(owner)
            .or_default()
            .insert(path.to_path_buf());
        Ok(file)
    }

    /// Drop the cached handle for `path`, e.g. after the file was deleted.
    pub fn forget(&self, path: &Path) {
        self.files.lock().remove(path);
        for paths in self.owners.lock().values_mut() {
            paths.remove(path);
        }
    }

    /// Drop every handle `owner` opened. Returns the number of handles closed.
    pub fn close_owner(&self, owner: u64) -> usize {
        let Some(paths) = self.owners.lock().remove(&owner) else {
            return 0;
        };
        let mut files = self.files.lock();
        paths
            .iter()
            .filter(|path| files.remove(path.as_path()).is_some())
            .count()
    }

    /// Drop every cached handle.
    pub fn close_all(&self) {
        self.files.lock().clear();
        self.owners.lock().clear();
    }

    /// Swap the cached handle for `path`.
    #[cfg(test)]
    pub(crate) fn replace(&self, path: &Path, file: Arc<PageFile>) {
        self.files.lock().insert(path.to_path_buf(), file);
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_returns_cached_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let registry = HandleRegistry::new();

        let a = registry.open(1, &path, true).unwrap();
        let b = registry.open(2, &path, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_owner_drops_its_handles() {
        let dir = tempdir().unwrap();
        let registry = HandleRegistry::new();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");

        registry.open(1, &a, true).unwrap();
        registry.open(1, &b, true).unwrap();
        registry.open(2, &b, true).unwrap();

        assert_eq!(registry.close_owner(1), 2);
        assert!(!registry.is_open(&a));
        assert!(!registry.is_open(&b));
        assert_eq!(registry.close_owner(1), 0);
    }

    #[test]
    fn test_forget() {
        let dir = tempdir().unwrap();
        let registry = HandleRegistry::new();
        let a = dir.path().join("a.db");

        registry.open(1, &a, true).unwrap();
        registry.forget(&a);
        assert!(registry.is_empty());
        assert_eq!(registry.close_owner(1), 0);
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let registry = HandleRegistry::new();
        assert!(registry.open(1, &dir.path().join("nope.db"), false).is_err());
        assert!(registry.is_empty());
    }
}
