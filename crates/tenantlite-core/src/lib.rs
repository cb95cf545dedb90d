//! # TenantLite
//!
//! A multi-tenant front-end over embedded SQLite databases.
//!
//! Every tenant database is opened through a per-connection VFS shim that
//! routes page writes into an in-memory dirty-page log. Writes are serialized
//! by a single process-wide gate, checkpointed to disk on commit, and the
//! resulting changed-page set is persisted as a content-addressed incremental
//! backup. Each statement is authorized against the caller's access key
//! through SQLite's authorizer hook.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tenantlite_core::auth::{AccessKey, Privilege};
//! use tenantlite_core::config::Config;
//! use tenantlite_core::context::Context;
//! use tenantlite_core::query::Query;
//! use tenantlite_core::resolver::Resolver;
//! use tenantlite_core::secrets::MemorySecretsStore;
//! use tenantlite_core::types::ConnectionKey;
//!
//! let secrets = Arc::new(MemorySecretsStore::new());
//! secrets.put_database("acme", "main", "acme/main.db");
//! secrets.put_access_key(AccessKey::new("acme", "main", "key-1").grant("*", [Privilege::All]));
//!
//! let context = Context::new(Config::new("/tmp/tenantlite"), secrets, None).unwrap();
//! let resolver = Resolver::new(context);
//! let key = ConnectionKey::new("acme", "main", "key-1");
//!
//! resolver
//!     .handle_query(&key, Query::new("CREATE TABLE t (x INTEGER)"))
//!     .unwrap();
//! let result = resolver.handle_query(&key, Query::new("SELECT count(*) FROM t")).unwrap();
//! assert_eq!(result.rows.len(), 1);
//! ```

pub mod auth;
pub mod backup;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod query;
pub mod resolver;
pub mod secrets;
pub mod storage;
pub mod types;
pub mod vfs;
pub mod wal;
