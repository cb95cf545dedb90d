use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::BackupError;

use super::object::{ObjectStore, sha1_hex};

/// One checkpoint's contribution to a snapshot.
///
/// The commit is stored as an object whose content is its object hashes
/// joined by newlines, so its hash is the SHA-1 of that content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    /// Snapshot (day) timestamp.
    pub timestamp: i64,
    /// When the commit was made.
    pub commit_timestamp: i64,
    pub object_hashes: Vec<String>,
}

impl Commit {
    /// Build a commit over `hashes`, keeping the first occurrence of each.
    pub fn new(
        timestamp: i64,
        commit_timestamp: i64,
        hashes: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut seen = HashSet::new();
        let object_hashes: Vec<String> = hashes
            .into_iter()
            .filter(|h| seen.insert(h.clone()))
            .collect();
        let hash = sha1_hex(content_of(&object_hashes).as_bytes());
        Self {
            hash,
            timestamp,
            commit_timestamp,
            object_hashes,
        }
    }

    pub fn content(&self) -> String {
        content_of(&self.object_hashes)
    }

    /// Persist the commit object. Saving identical content again is a no-op.
    pub fn save(&self, objects: &ObjectStore) -> Result<(), BackupError> {
        let written = objects.write(self.content().as_bytes())?;
        debug_assert_eq!(written, self.hash);
        Ok(())
    }

    /// Load a commit object by hash.
    pub fn load(objects: &ObjectStore, hash: &str, timestamp: i64) -> Result<Self, BackupError> {
        let bytes = objects.read(hash)?;
        let content = String::from_utf8(bytes)
            .map_err(|_| BackupError::InvalidObject(format!("commit {hash} is not UTF-8")))?;
        let object_hashes: Vec<String> = content
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            hash: hash.to_string(),
            timestamp,
            commit_timestamp: timestamp,
            object_hashes,
        })
    }
}

fn content_of(hashes: &[String]) -> String {
    hashes.join("\n")
}
