use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::error::BackupError;

use super::write_atomic;

/// Lowercase hex SHA-1 of `bytes`.
pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Content-addressed blob store: `<dir>/<hash[0:2]>/<hash[2:]>`.
#[derive(Debug)]
pub struct ObjectStore {
    dir: PathBuf,
    /// Fan-out directories known to exist.
    known_dirs: Mutex<HashSet<String>>,
}

impl ObjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            known_dirs: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn object_path(&self, hash: &str) -> PathBuf {
        let (prefix, rest) = hash.split_at(2.min(hash.len()));
        self.dir.join(prefix).join(rest)
    }

    /// Store `bytes` and return their hash. Writing content that is already
    /// present is a no-op; a file of the wrong length under the hash is
    /// replaced.
    pub fn write(&self, bytes: &[u8]) -> Result<String, BackupError> {
        let hash = sha1_hex(bytes);
        let path = self.object_path(&hash);
        self.ensure_dir(&hash[..2])?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() == bytes.len() as u64 => return Ok(hash),
            Ok(meta) => {
                warn!(path = %path.display(), len = meta.len(), "replacing truncated object");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BackupError::io(&path, e)),
        }
        write_atomic(&path, bytes)?;
        Ok(hash)
    }

    pub fn read(&self, hash: &str) -> Result<Vec<u8>, BackupError> {
        let path = self.object_path(hash);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackupError::NotFound(format!("object {hash}")))
            }
            Err(e) => Err(BackupError::io(&path, e)),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    fn ensure_dir(&self, prefix: &str) -> Result<(), BackupError> {
        let mut known = self.known_dirs.lock();
        if known.contains(prefix) {
            return Ok(());
        }
        let dir = self.dir.join(prefix);
        std::fs::create_dir_all(&dir).map_err(|e| BackupError::io(&dir, e))?;
        known.insert(prefix.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sha1_hex_known_value() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_write_is_content_addressed() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));

        let hash = store.write(b"page bytes").unwrap();
        let path = dir
            .path()
            .join("objects")
            .join(&hash[..2])
            .join(&hash[2..]);
        assert!(path.exists());
        assert_eq!(store.read(&hash).unwrap(), b"page bytes");
    }

    #[test]
    fn test_write_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());

        let a = store.write(&[7u8; 512]).unwrap();
        let b = store.write(&[7u8; 512]).unwrap();
        assert_eq!(a, b);
        assert!(store.contains(&a));
    }

    #[test]
    fn test_truncated_object_is_rewritten() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let content = [3u8; 512];
        let path = store.object_path(&sha1_hex(&content));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, &content[..100]).unwrap();

        let hash = store.write(&content).unwrap();
        assert_eq!(store.read(&hash).unwrap(), content.to_vec());
        assert_eq!(sha1_hex(&store.read(&hash).unwrap()), hash);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        match store.read("0123456789") {
            Err(BackupError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
