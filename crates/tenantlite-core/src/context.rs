//! Process-wide state shared by every request.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::info;

use crate::auth::AccessKey;
use crate::backup::{BackupEngine, FullBackup, ObjectStorage, Restorer};
use crate::config::{BackupMode, Config};
use crate::engine::{Connection, ConnectionManager};
use crate::error::{Error, Result, StorageError, ValidationError};
use crate::secrets::{AccessKeyCache, SecretsStore};
use crate::types::ConnectionKey;
use crate::vfs::{self, HandleRegistry};

/// Owns the handle registry, the connection cache, the access-key cache and
/// the global write gate. Build one with [`Context::new`] and release its
/// resources with [`Context::shutdown`]; tests get a fresh one each.
#[derive(Debug)]
pub struct Context {
    config: Config,
    secrets: Arc<dyn SecretsStore>,
    handles: Arc<HandleRegistry>,
    connections: ConnectionManager,
    access_keys: AccessKeyCache,
    write_gate: Mutex<()>,
    backups: BackupEngine,
    full_backup: FullBackup,
    restorer: Restorer,
}

impl Context {
    pub fn new(
        config: Config,
        secrets: Arc<dyn SecretsStore>,
        object_storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if matches!(config.backup_mode, BackupMode::Remote { .. }) && object_storage.is_none() {
            return Err(ValidationError::field(
                "backup_mode",
                "remote backups need an object storage backend",
            )
            .into());
        }
        for dir in [&config.data_dir, &config.scratch_dir, &config.backup_dir] {
            std::fs::create_dir_all(dir).map_err(StorageError::Io)?;
        }

        let handles = Arc::new(HandleRegistry::new());
        info!(
            data_dir = %config.data_dir.display(),
            backup_dir = %config.backup_dir.display(),
            backup_mode = ?config.backup_mode,
            "context initialized"
        );
        Ok(Arc::new(Self {
            connections: ConnectionManager::new(Arc::clone(&handles)),
            access_keys: AccessKeyCache::new(Arc::clone(&secrets)),
            backups: BackupEngine::new(config.backup_dir.clone()),
            full_backup: FullBackup::new(config.backup_mode.clone(), object_storage),
            restorer: Restorer::new(config.backup_dir.clone()),
            write_gate: Mutex::new(()),
            handles,
            secrets,
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.backups
    }

    pub fn full_backup(&self) -> &FullBackup {
        &self.full_backup
    }

    pub fn restorer(&self) -> &Restorer {
        &self.restorer
    }

    /// The single process-wide writer lock.
    pub fn write_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock()
    }

    /// Load the access key for `key` and check that it belongs to the
    /// requested tenant branch.
    pub fn authorize(&self, key: &ConnectionKey) -> Result<Arc<AccessKey>> {
        let access_key = self.access_keys.get(&key.access_key_id)?;
        if access_key.tenant != key.tenant || access_key.branch != key.branch {
            return Err(Error::AccessDenied(key.access_key_id.clone()));
        }
        Ok(access_key)
    }

    /// Logical database name of a tenant branch, relative to the data
    /// directory.
    pub fn database_name(&self, tenant: &str, branch: &str) -> Result<String> {
        let stored = self
            .secrets
            .database_path(tenant, branch)?
            .ok_or_else(|| Error::NotFound(format!("database {tenant}/{branch}")))?;
        self.secrets.decrypt(&stored)
    }

    pub fn database_path(&self, tenant: &str, branch: &str) -> Result<PathBuf> {
        let name = self.database_name(tenant, branch)?;
        Ok(vfs::storage_path(&self.config.data_dir, &name))
    }

    /// The open connection for `key`, opening one if needed.
    pub fn connection(&self, key: &ConnectionKey) -> Result<Arc<Connection>> {
        let access_key = self.authorize(key)?;
        let name = self.database_name(&key.tenant, &key.branch)?;
        self.connections
            .get_or_open(key, &name, &self.config, access_key)
    }

    /// Forget a cached access key and close its connections. Runs under the
    /// write gate so no committed transaction loses its checkpoint.
    pub fn invalidate_access_key(&self, access_key_id: &str) -> usize {
        let _gate = self.write_gate();
        self.access_keys.invalidate(access_key_id);
        let closed = self.connections.close_access_key(access_key_id);
        info!(access_key_id, connections = closed, "access key invalidated");
        closed
    }

    /// Close every connection and drop every cached handle and key.
    pub fn shutdown(&self) {
        let _gate = self.write_gate();
        self.connections.close_all();
        self.handles.close_all();
        self.access_keys.clear();
        info!("context shut down");
    }
}
