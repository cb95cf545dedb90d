//! Request execution under the global write gate.
//!
//! A statement is read-only when its text starts with `SELECT`. Read-only
//! requests run without the gate. Anything else takes the gate for the
//! whole transaction: `BEGIN`, every statement, `COMMIT`, checkpoint and
//! incremental backup, in that order, before the gate is released.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::{AccessKey, Privilege};
use crate::backup::{Commit, FullBackupHandle, RestoreSummary};
use crate::context::Context;
use crate::engine::Connection;
use crate::error::{Error, PrivilegeError, Result, ValidationError};
use crate::query::{BatchItem, BatchResult, Query, QueryResult};
use crate::types::{ConnectionKey, WILDCARD};
use crate::vfs;

/// True when `sql` starts with `SELECT`, ignoring leading whitespace and
/// case.
pub fn is_read_only(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
}

/// A batch needs the write gate if any member is not read-only.
pub fn requires_lock(queries: &[Query]) -> bool {
    queries.iter().any(|q| !is_read_only(&q.statement))
}

#[derive(Debug, Clone)]
pub struct Resolver {
    context: Arc<Context>,
}

impl Resolver {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Run one statement. A failing statement inside the write path still
    /// commits the (empty) transaction before its error is returned.
    pub fn handle_query(&self, key: &ConnectionKey, query: Query) -> Result<QueryResult> {
        let conn = self.context.connection(key)?;
        let queries = [query];
        let mut results = if requires_lock(&queries) {
            self.run_locked(&conn, &queries)?.0
        } else {
            let results = vec![conn.execute(&queries[0])];
            self.flush_unlocked(&conn)?;
            results
        };
        results
            .pop()
            .unwrap_or_else(|| Err(ValidationError::field("statement", "no result").into()))
    }

    /// Run every statement of a batch. Statement failures are reported per
    /// item; failures to begin or commit the transaction fail the batch.
    pub fn handle_batch(&self, key: &ConnectionKey, queries: Vec<Query>) -> Result<BatchResult> {
        if queries.is_empty() {
            return Err(ValidationError::field("statements", "batch must not be empty").into());
        }
        let conn = self.context.connection(key)?;
        let (results, commit) = if requires_lock(&queries) {
            self.run_locked(&conn, &queries)?
        } else {
            let results = queries.iter().map(|q| conn.execute(q)).collect();
            (results, self.flush_unlocked(&conn)?)
        };
        Ok(BatchResult {
            results: results.into_iter().map(BatchItem::from).collect(),
            commit: commit.map(|c| c.hash),
        })
    }

    fn run_locked(
        &self,
        conn: &Connection,
        queries: &[Query],
    ) -> Result<(Vec<Result<QueryResult>>, Option<Commit>)> {
        let _gate = self.context.write_gate();
        debug!(connection = %conn.key(), statements = queries.len(), "write gate acquired");

        conn.begin()?;
        let results: Vec<Result<QueryResult>> = queries.iter().map(|q| conn.execute(q)).collect();

        // A statement may itself have ended the transaction.
        if !conn.is_autocommit() {
            if let Err(e) = conn.commit() {
                if let Err(rollback) = conn.rollback() {
                    warn!(connection = %conn.key(), error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        }
        conn.operator().end();

        let commit = self.flush(conn)?;
        Ok((results, commit))
    }

    /// Checkpoint `conn` and back up whatever pages changed. The caller
    /// holds the write gate.
    fn flush(&self, conn: &Connection) -> Result<Option<Commit>> {
        let changed = conn.checkpoint()?;
        conn.operator().take_writing();
        let key = conn.key();
        Ok(self
            .context
            .backups()
            .run_incremental_backup(&key.tenant, &key.branch, &changed)?)
    }

    /// After an ungated statement, checkpoint only if the engine reported a
    /// write.
    fn flush_unlocked(&self, conn: &Connection) -> Result<Option<Commit>> {
        if !conn.operator().is_writing() {
            return Ok(None);
        }
        let _gate = self.context.write_gate();
        self.flush(conn)
    }

    /// Flush any buffered pages for `key` and back them up.
    pub fn checkpoint(&self, key: &ConnectionKey) -> Result<Option<Commit>> {
        let conn = self.context.connection(key)?;
        let _gate = self.context.write_gate();
        self.flush(&conn)
    }

    /// Archive the tenant branch's database file.
    pub fn full_backup(&self, key: &ConnectionKey) -> Result<FullBackupHandle> {
        self.context.authorize(key)?;
        let path = self.context.database_path(&key.tenant, &key.branch)?;
        Ok(self
            .context
            .full_backup()
            .run(&key.tenant, &key.branch, &path)?)
    }

    pub fn backup_size(&self, key: &ConnectionKey, handle: &FullBackupHandle) -> Result<u64> {
        self.authorize_handle(key, handle)?;
        Ok(self.context.full_backup().size(handle)?)
    }

    pub fn delete_backup(&self, key: &ConnectionKey, handle: &FullBackupHandle) -> Result<()> {
        require_all(&*self.authorize_handle(key, handle)?)?;
        Ok(self.context.full_backup().delete(handle)?)
    }

    /// Rebuild the branch from incremental snapshots into `destination`, a
    /// logical name below the data directory. The day containing
    /// `timestamp` is restored as of its last backup.
    pub fn restore(
        &self,
        key: &ConnectionKey,
        timestamp: i64,
        destination: &str,
    ) -> Result<RestoreSummary> {
        require_all(&*self.context.authorize(key)?)?;
        let dest = self.restore_destination(key, destination)?;
        Ok(self
            .context
            .restorer()
            .restore_to(&key.tenant, &key.branch, timestamp, &dest)?)
    }

    /// Inflate a full-backup archive into `destination`. Returns the number
    /// of bytes written.
    pub fn restore_full_backup(
        &self,
        key: &ConnectionKey,
        handle: &FullBackupHandle,
        destination: &str,
    ) -> Result<u64> {
        require_all(&*self.authorize_handle(key, handle)?)?;
        let dest = self.restore_destination(key, destination)?;
        Ok(self.context.full_backup().restore(handle, &dest)?)
    }

    pub fn invalidate_access_key(&self, access_key_id: &str) -> usize {
        self.context.invalidate_access_key(access_key_id)
    }

    fn authorize_handle(
        &self,
        key: &ConnectionKey,
        handle: &FullBackupHandle,
    ) -> Result<Arc<AccessKey>> {
        let access_key = self.context.authorize(key)?;
        if handle.tenant != key.tenant || handle.branch != key.branch {
            return Err(Error::AccessDenied(key.access_key_id.clone()));
        }
        Ok(access_key)
    }

    /// Restores never overwrite the live database.
    fn restore_destination(&self, key: &ConnectionKey, destination: &str) -> Result<PathBuf> {
        let dest = vfs::storage_path(&self.context.config().data_dir, destination);
        let live = self.context.database_path(&key.tenant, &key.branch)?;
        if destination.trim().is_empty() || dest == live || dest == self.context.config().data_dir
        {
            return Err(ValidationError::field(
                "destination",
                "must name a file other than the live database",
            )
            .into());
        }
        Ok(dest)
    }
}

fn require_all(access_key: &AccessKey) -> Result<()> {
    if access_key.general(WILDCARD, Privilege::All) {
        Ok(())
    } else {
        Err(PrivilegeError::new(Privilege::All).into())
    }
}
