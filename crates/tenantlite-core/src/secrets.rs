//! Secrets store: access keys and tenant database locations.
//!
//! The store itself is a collaborator behind [`SecretsStore`]. Two
//! implementations ship here: a JSON-directory store for deployments and an
//! in-memory store for embedding and tests. Access keys are cached per id by
//! [`AccessKeyCache`] until invalidated.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::AccessKey;
use crate::error::{Error, Result, StorageError};

pub trait SecretsStore: Send + Sync + std::fmt::Debug {
    /// Look up an access key by id. `None` if no such key exists.
    fn access_key(&self, id: &str) -> Result<Option<AccessKey>>;

    /// Logical database name for a tenant branch, relative to the data
    /// directory.
    fn database_path(&self, tenant: &str, branch: &str) -> Result<Option<String>>;

    /// Decrypt a stored secret.
    fn decrypt(&self, text: &str) -> Result<String>;
}

/// Database locations as stored in `databases.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatabaseEntry {
    tenant: String,
    branch: String,
    path: String,
}

/// Reads plaintext JSON documents from a directory:
///
/// ```text
/// <dir>/access_keys/<id>.json   one AccessKey per file
/// <dir>/databases.json          [{"tenant", "branch", "path"}, ...]
/// ```
#[derive(Debug, Clone)]
pub struct FileSecretsStore {
    dir: PathBuf,
}

impl FileSecretsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e).into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Io(e.into()).into())
    }
}

/// Rejects ids that would escape the key directory.
fn is_plain_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && id != "." && id != ".."
}

impl SecretsStore for FileSecretsStore {
    fn access_key(&self, id: &str) -> Result<Option<AccessKey>> {
        if !is_plain_id(id) {
            return Ok(None);
        }
        let path = self.dir.join("access_keys").join(format!("{id}.json"));
        self.read_json(&path)
    }

    fn database_path(&self, tenant: &str, branch: &str) -> Result<Option<String>> {
        let entries: Vec<DatabaseEntry> = self
            .read_json(&self.dir.join("databases.json"))?
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .find(|e| e.tenant == tenant && e.branch == branch)
            .map(|e| e.path))
    }

    fn decrypt(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

/// In-process store, populated programmatically.
#[derive(Debug, Default)]
pub struct MemorySecretsStore {
    keys: RwLock<HashMap<String, AccessKey>>,
    databases: RwLock<HashMap<(String, String), String>>,
}

impl MemorySecretsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_access_key(&self, key: AccessKey) {
        self.keys.write().insert(key.access_key_id.clone(), key);
    }

    pub fn delete_access_key(&self, id: &str) -> bool {
        self.keys.write().remove(id).is_some()
    }

    pub fn put_database(&self, tenant: &str, branch: &str, path: impl Into<String>) {
        self.databases
            .write()
            .insert((tenant.to_string(), branch.to_string()), path.into());
    }
}

impl SecretsStore for MemorySecretsStore {
    fn access_key(&self, id: &str) -> Result<Option<AccessKey>> {
        Ok(self.keys.read().get(id).cloned())
    }

    fn database_path(&self, tenant: &str, branch: &str) -> Result<Option<String>> {
        Ok(self
            .databases
            .read()
            .get(&(tenant.to_string(), branch.to_string()))
            .cloned())
    }

    fn decrypt(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

/// Caches access keys loaded from a [`SecretsStore`].
#[derive(Debug)]
pub struct AccessKeyCache {
    store: Arc<dyn SecretsStore>,
    keys: RwLock<HashMap<String, Arc<AccessKey>>>,
}

impl AccessKeyCache {
    pub fn new(store: Arc<dyn SecretsStore>) -> Self {
        Self {
            store,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SecretsStore> {
        &self.store
    }

    /// Return the cached key, loading it from the store on a miss.
    pub fn get(&self, id: &str) -> Result<Arc<AccessKey>> {
        if let Some(key) = self.keys.read().get(id) {
            return Ok(Arc::clone(key));
        }
        let key = self
            .store
            .access_key(id)?
            .ok_or_else(|| Error::AccessDenied(id.to_string()))?;
        let key = Arc::new(key);
        self.keys.write().insert(id.to_string(), Arc::clone(&key));
        debug!(access_key_id = id, "access key loaded");
        Ok(key)
    }

    /// Drop a cached key so the next lookup reloads it. Returns whether the
    /// key was cached.
    pub fn invalidate(&self, id: &str) -> bool {
        self.keys.write().remove(id).is_some()
    }

    pub fn clear(&self) {
        self.keys.write().clear();
    }
}
