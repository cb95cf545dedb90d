use std::collections::HashMap;
use std::path::Path;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::hooks::{AuthAction as SqlAction, AuthContext, Authorization};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{OpenFlags, params_from_iter};
use serde_json::Value;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::auth::{AccessKey, AuthAction, AuthDecision, Authorizer};
use crate::config::Config;
use crate::error::{EngineError, Error, PrivilegeError, Result, ValidationError, WalError};
use crate::query::{Query, QueryResult};
use crate::storage::PageFile;
use crate::types::{ChangedPages, ConnectionKey};
use crate::vfs::{self, HandleRegistry, VfsShim};

use super::ffi::{VfsRegistration, next_vfs_id};
use super::operator::Operator;

/// What the engine reported about a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementInfo {
    pub readonly: bool,
    pub parameter_count: usize,
}

/// Cache key for a statement: xxh64 of its text.
pub fn statement_key(sql: &str) -> u64 {
    xxh64(sql.as_bytes(), 0)
}

struct Inner {
    // Declared before `registration`: the database must close before its
    // VFS is unregistered.
    db: Option<rusqlite::Connection>,
    registration: Option<VfsRegistration>,
    statements: HashMap<u64, StatementInfo>,
    capacity: usize,
}

/// One engine handle for a tenant branch, opened on behalf of one access
/// key.
///
/// Page writes go to the connection's dirty-page log until
/// [`Connection::checkpoint`] flushes them. Every statement is authorized
/// against the access key while it is prepared.
pub struct Connection {
    key: ConnectionKey,
    shim: Arc<VfsShim>,
    operator: Operator,
    denied: Arc<Mutex<Option<PrivilegeError>>>,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("database", &self.shim.database_path())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Open `database_name` (relative to the data directory) through a
    /// freshly registered VFS.
    pub fn open(
        key: ConnectionKey,
        database_name: &str,
        config: &Config,
        handles: Arc<HandleRegistry>,
        access_key: Arc<AccessKey>,
    ) -> Result<Self> {
        let database_path = vfs::storage_path(&config.data_dir, database_name);
        let page_size = existing_page_size(&database_path)?.unwrap_or(config.page_size);

        let shim = Arc::new(VfsShim::new(
            next_vfs_id(),
            config.data_dir.clone(),
            config.scratch_dir.clone(),
            database_name,
            page_size,
            handles,
        ));
        let registration = VfsRegistration::register(Arc::clone(&shim))?;
        let db = rusqlite::Connection::open_with_flags_and_vfs(
            database_name,
            OpenFlags::default(),
            registration.name(),
        )
        .map_err(EngineError::from)?;
        db.pragma_update(None, "page_size", page_size)
            .map_err(EngineError::from)?;
        db.set_prepared_statement_cache_capacity(config.statement_cache_capacity);

        let denied = Arc::new(Mutex::new(None));
        install_authorizer(&db, Authorizer::new(access_key), Arc::clone(&denied));

        info!(
            connection = %key,
            vfs = registration.name(),
            path = %database_path.display(),
            page_size,
            "connection opened"
        );
        Ok(Self {
            key,
            shim,
            operator: Operator::new(),
            denied,
            inner: Mutex::new(Inner {
                db: Some(db),
                registration: Some(registration),
                statements: HashMap::new(),
                capacity: config.statement_cache_capacity,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn database_path(&self) -> &Path {
        self.shim.database_path()
    }

    pub fn shim(&self) -> &Arc<VfsShim> {
        &self.shim
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cached engine facts about `sql`, if it has been executed.
    pub fn statement_info(&self, sql: &str) -> Option<StatementInfo> {
        self.inner.lock().statements.get(&statement_key(sql)).copied()
    }

    /// Prepare, authorize, bind and run one statement, collecting every row.
    pub fn execute(&self, query: &Query) -> Result<QueryResult> {
        query.validate()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let db = inner.db.as_ref().ok_or(EngineError::Closed)?;

        self.denied.lock().take();
        let mut stmt = db
            .prepare_cached(&query.statement)
            .map_err(|e| self.prepare_error(e))?;

        if inner.statements.len() >= inner.capacity {
            inner.statements.clear();
        }
        let info = *inner
            .statements
            .entry(statement_key(&query.statement))
            .or_insert_with(|| StatementInfo {
                readonly: stmt.readonly(),
                parameter_count: stmt.parameter_count(),
            });
        if info.parameter_count != query.parameters.len() {
            return Err(ValidationError::field(
                "parameters",
                format!(
                    "expected {} parameters, got {}",
                    info.parameter_count,
                    query.parameters.len()
                ),
            )
            .into());
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let params: Vec<SqlValue> = query.parameters.iter().map(to_sql_value).collect();

        let mut rows = Vec::new();
        let mut cursor = stmt
            .query(params_from_iter(params.iter()))
            .map_err(EngineError::from)?;
        while let Some(row) = cursor.next().map_err(EngineError::from)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(to_json(row.get_ref(i).map_err(EngineError::from)?));
            }
            rows.push(values);
        }
        drop(cursor);
        drop(stmt);

        let mut result = QueryResult {
            columns,
            rows,
            ..QueryResult::default()
        };
        if !info.readonly {
            self.operator.mark_writing();
            result.changes = db.changes() as u64;
            result.last_insert_row_id = db.last_insert_rowid();
        }
        debug!(connection = %self.key, readonly = info.readonly, rows = result.rows.len(), "statement executed");
        Ok(result)
    }

    fn prepare_error(&self, e: rusqlite::Error) -> Error {
        match self.denied.lock().take() {
            Some(denial) => Error::Privilege(denial),
            None => Error::Engine(e.into()),
        }
    }

    fn exec_batch(&self, sql: &str) -> Result<()> {
        let inner = self.inner.lock();
        let db = inner.db.as_ref().ok_or(EngineError::Closed)?;
        db.execute_batch(sql).map_err(EngineError::from)?;
        Ok(())
    }

    pub fn begin(&self) -> Result<()> {
        self.exec_batch("BEGIN")?;
        self.operator.begin();
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.exec_batch("COMMIT")?;
        self.operator.end();
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.operator.end();
        self.exec_batch("ROLLBACK")
    }

    /// True when no transaction is open on the engine handle.
    pub fn is_autocommit(&self) -> bool {
        self.inner
            .lock()
            .db
            .as_ref()
            .is_none_or(|db| db.is_autocommit())
    }

    /// Flush the dirty-page log to the database file. A failed write closes
    /// the connection.
    pub fn checkpoint(&self) -> Result<ChangedPages> {
        let mut inner = self.inner.lock();
        if inner.db.is_none() {
            return Err(EngineError::Closed.into());
        }
        match self.shim.wal().checkpoint() {
            Ok(changed) => Ok(changed),
            Err(e @ WalError::Fatal { .. }) => {
                self.close_locked(&mut inner);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the engine handle, unregister the VFS and force-close every
    /// file handle this connection opened. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.close_locked(&mut inner);
    }

    fn close_locked(&self, inner: &mut Inner) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.statements.clear();
        if let Some(db) = inner.db.take() {
            if let Err((_, e)) = db.close() {
                warn!(connection = %self.key, error = %e, "engine close failed");
            }
        }
        inner.registration.take();
        let handles = self.shim.close_all();
        self.operator.end();
        info!(connection = %self.key, handles, "connection closed");
    }
}

/// Page size recorded in an existing database file.
fn existing_page_size(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = PageFile::open(path, false)?;
    Ok(file.header()?.map(|h| h.page_size))
}

struct AuthHook {
    authorizer: Authorizer,
    denied: Arc<Mutex<Option<PrivilegeError>>>,
}

impl AuthHook {
    fn decide(&self, ctx: AuthContext<'_>) -> Authorization {
        match self.authorizer.authorize(map_action(ctx.action), ctx.database_name) {
            AuthDecision::Allow => Authorization::Allow,
            AuthDecision::Ignore => Authorization::Ignore,
            AuthDecision::Deny(denial) => {
                *self.denied.lock() = Some(denial);
                Authorization::Deny
            }
        }
    }
}

fn install_authorizer(
    db: &rusqlite::Connection,
    authorizer: Authorizer,
    denied: Arc<Mutex<Option<PrivilegeError>>>,
) {
    let hook = AssertUnwindSafe(AuthHook { authorizer, denied });
    db.authorizer(Some(move |ctx: AuthContext<'_>| hook.decide(ctx)));
}

fn map_action(action: SqlAction<'_>) -> AuthAction<'_> {
    match action {
        SqlAction::CreateIndex { table_name, .. }
        | SqlAction::CreateTempIndex { table_name, .. }
        | SqlAction::DropIndex { table_name, .. }
        | SqlAction::DropTempIndex { table_name, .. }
        | SqlAction::Analyze { table_name, .. } => AuthAction::Index { table: table_name },
        SqlAction::Reindex { index_name, .. } => AuthAction::Index { table: index_name },
        SqlAction::CreateTable { table_name, .. }
        | SqlAction::CreateTempTable { table_name, .. } => AuthAction::Create { table: table_name },
        SqlAction::CreateView { view_name, .. } | SqlAction::CreateTempView { view_name, .. } => {
            AuthAction::Create { table: view_name }
        }
        SqlAction::CreateTrigger { table_name, .. }
        | SqlAction::CreateTempTrigger { table_name, .. } => {
            AuthAction::CreateTrigger { table: table_name }
        }
        SqlAction::DropTable { table_name, .. }
        | SqlAction::DropTempTable { table_name, .. }
        | SqlAction::DropTrigger { table_name, .. }
        | SqlAction::DropTempTrigger { table_name, .. } => AuthAction::Drop { table: table_name },
        SqlAction::DropView { view_name, .. } | SqlAction::DropTempView { view_name, .. } => {
            AuthAction::Drop { table: view_name }
        }
        SqlAction::Insert { table_name, .. } => AuthAction::Insert { table: table_name },
        SqlAction::Delete { table_name, .. } => AuthAction::Delete { table: table_name },
        SqlAction::Update { table_name, .. } => AuthAction::Update { table: table_name },
        SqlAction::AlterTable { table_name, .. } => AuthAction::Alter { table: table_name },
        SqlAction::Pragma { .. } => AuthAction::Pragma,
        SqlAction::Read { .. } => AuthAction::Read,
        SqlAction::Select => AuthAction::Select,
        SqlAction::Transaction { .. }
        | SqlAction::Savepoint { .. }
        | SqlAction::Function { .. }
        | SqlAction::Recursive => AuthAction::Permitted,
        _ => AuthAction::Forbidden,
    }
}

/// Bind a JSON parameter. Arrays and objects bind as their JSON text.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Convert a column value. Blobs become lowercase hex strings.
fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Privilege;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn open(dir: &TempDir, handles: &Arc<HandleRegistry>, key: AccessKey) -> Connection {
        let config = Config::new(dir.path()).with_page_size(1024);
        let conn_key = ConnectionKey::new(&key.tenant, &key.branch, &key.access_key_id);
        Connection::open(
            conn_key,
            "acme/main.db",
            &config,
            Arc::clone(handles),
            Arc::new(key),
        )
        .unwrap()
    }

    fn admin() -> AccessKey {
        AccessKey::new("acme", "main", "admin").grant("*", [Privilege::All])
    }

    #[test]
    fn test_statement_key_is_xxh64() {
        assert_eq!(statement_key("SELECT 1"), xxh64(b"SELECT 1", 0));
        assert_ne!(statement_key("SELECT 1"), statement_key("SELECT 2"));
    }

    #[test]
    fn test_writes_stay_in_wal_until_checkpoint() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let conn = open(&dir, &handles, admin());

        conn.execute(&Query::new("CREATE TABLE t (x INTEGER)")).unwrap();
        let result = conn
            .execute(&Query::new("INSERT INTO t VALUES (?1)").with_parameters([json!(42)]))
            .unwrap();
        assert_eq!(result.changes, 1);
        assert!(conn.operator().take_writing());
        assert!(!conn.shim().wal().is_empty());

        let path = dir.path().join("data/acme/main.db");
        assert_eq!(std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0), 0);

        let result = conn.execute(&Query::new("SELECT x FROM t")).unwrap();
        assert_eq!(result.columns, vec!["x"]);
        assert_eq!(result.rows, vec![vec![json!(42)]]);
        assert!(!conn.operator().is_writing());

        let changed = conn.checkpoint().unwrap();
        assert!(!changed.is_empty());
        assert!(conn.shim().wal().is_empty());
        let file = PageFile::open(&path, false).unwrap();
        assert_eq!(file.header().unwrap().unwrap().page_size, 1024);
    }

    #[test]
    fn test_statement_info_cached() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let conn = open(&dir, &handles, admin());

        conn.execute(&Query::new("SELECT 1")).unwrap();
        assert_eq!(
            conn.statement_info("SELECT 1"),
            Some(StatementInfo {
                readonly: true,
                parameter_count: 0
            })
        );
        assert_eq!(conn.statement_info("SELECT 2"), None);
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let conn = open(&dir, &handles, admin());

        match conn.execute(&Query::new("SELECT ?1, ?2").with_parameters([json!(1)])) {
            Err(Error::Validation(e)) => assert_eq!(e.errors[0].field, "parameters"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_denied_insert_is_privilege_error() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let admin_conn = open(&dir, &handles, admin());
        admin_conn.execute(&Query::new("CREATE TABLE t (x INTEGER)")).unwrap();
        admin_conn.checkpoint().unwrap();

        let reader = AccessKey::new("acme", "main", "reader").grant("*", [Privilege::Select]);
        let conn = open(&dir, &handles, reader);

        match conn.execute(&Query::new("INSERT INTO t VALUES (1)")) {
            Err(Error::Privilege(e)) => assert_eq!(e.verb, Privilege::Insert),
            other => panic!("expected Privilege, got {other:?}"),
        }
        let result = conn.execute(&Query::new("SELECT count(*) FROM t")).unwrap();
        assert_eq!(result.rows, vec![vec![json!(0)]]);
    }

    #[test]
    fn test_value_conversions() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let conn = open(&dir, &handles, admin());

        let result = conn
            .execute(
                &Query::new("SELECT ?1, ?2, ?3, ?4, x'CAFE'")
                    .with_parameters([json!(null), json!(true), json!(1.5), json!("hi")]),
            )
            .unwrap();
        assert_eq!(
            result.rows[0],
            vec![json!(null), json!(1), json!(1.5), json!("hi"), json!("cafe")]
        );
    }

    #[test]
    fn test_failed_checkpoint_write_closes_connection() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let conn = open(&dir, &handles, admin());
        conn.execute(&Query::new("CREATE TABLE t (x INTEGER)")).unwrap();
        conn.checkpoint().unwrap();
        conn.execute(&Query::new("INSERT INTO t VALUES (1)")).unwrap();
        assert!(!conn.shim().wal().is_empty());

        let path = conn.database_path().to_path_buf();
        handles.replace(&path, Arc::new(PageFile::open_read_only(&path).unwrap()));

        let err = conn.checkpoint().unwrap_err();
        assert_eq!(err.kind(), "IoFatal");
        assert!(err.is_fatal());
        match err {
            Error::Wal(WalError::Fatal { .. }) => {}
            other => panic!("expected Fatal, got {other:?}"),
        }
        assert!(conn.is_closed());
        match conn.execute(&Query::new("SELECT 1")) {
            Err(Error::Engine(EngineError::Closed)) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn test_transaction_and_close() {
        let dir = tempdir().unwrap();
        let handles = Arc::new(HandleRegistry::new());
        let conn = open(&dir, &handles, admin());

        conn.begin().unwrap();
        assert!(conn.operator().in_transaction());
        assert!(!conn.is_autocommit());
        conn.execute(&Query::new("CREATE TABLE t (x)")).unwrap();
        conn.commit().unwrap();
        assert!(conn.is_autocommit());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        match conn.execute(&Query::new("SELECT 1")) {
            Err(Error::Engine(EngineError::Closed)) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(handles.is_empty());
    }
}
