use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::BackupError;

/// Append-only list of commit hashes, one per line. A missing file means no
/// history.
#[derive(Debug, Clone)]
pub struct Head {
    path: PathBuf,
}

impl Head {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commits(&self) -> Result<Vec<String>, BackupError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(BackupError::io(&self.path, e)),
        }
    }

    pub fn last(&self) -> Result<Option<String>, BackupError> {
        Ok(self.commits()?.pop())
    }

    /// Append `hash` unless it is already the last line. Returns whether a
    /// line was written.
    pub fn append(&self, hash: &str) -> Result<bool, BackupError> {
        if self.last()?.as_deref() == Some(hash) {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BackupError::io(&self.path, e))?;
        writeln!(file, "{hash}").map_err(|e| BackupError::io(&self.path, e))?;
        file.sync_data().map_err(|e| BackupError::io(&self.path, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_head_is_empty() {
        let dir = tempdir().unwrap();
        let head = Head::new(dir.path().join("head"));
        assert!(head.commits().unwrap().is_empty());
        assert_eq!(head.last().unwrap(), None);
    }

    #[test]
    fn test_append_skips_repeat_of_last() {
        let dir = tempdir().unwrap();
        let head = Head::new(dir.path().join("head"));

        assert!(head.append("aaa").unwrap());
        assert!(!head.append("aaa").unwrap());
        assert!(head.append("bbb").unwrap());
        assert!(head.append("aaa").unwrap());

        assert_eq!(head.commits().unwrap(), vec!["aaa", "bbb", "aaa"]);
        assert_eq!(
            std::fs::read_to_string(head.path()).unwrap(),
            "aaa\nbbb\naaa\n"
        );
    }
}
