//! Wire protocol: JSON-over-newlines request/response types.
//!
//! Each request is a single JSON line naming its `op`; each response is a
//! single JSON line. Every tenant-scoped request names the caller's tenant,
//! branch and access key id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tenantlite_core::backup::{Commit, FullBackupHandle, RestoreSummary};
use tenantlite_core::query::{BatchItem, Query, QueryResult};

/// A request from a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Query {
        tenant: String,
        branch: String,
        access_key_id: String,
        statement: String,
        #[serde(default)]
        parameters: Vec<Value>,
    },
    Batch {
        tenant: String,
        branch: String,
        access_key_id: String,
        statements: Vec<Query>,
    },
    Checkpoint {
        tenant: String,
        branch: String,
        access_key_id: String,
    },
    FullBackup {
        tenant: String,
        branch: String,
        access_key_id: String,
    },
    BackupSize {
        tenant: String,
        branch: String,
        access_key_id: String,
        timestamp: i64,
    },
    DeleteBackup {
        tenant: String,
        branch: String,
        access_key_id: String,
        timestamp: i64,
    },
    Restore {
        tenant: String,
        branch: String,
        access_key_id: String,
        timestamp: i64,
        destination: String,
    },
    RestoreFullBackup {
        tenant: String,
        branch: String,
        access_key_id: String,
        timestamp: i64,
        destination: String,
    },
    InvalidateAccessKey {
        access_key_id: String,
    },
}

/// A response sent back to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok(OkResponse),
    Error(ErrorResponse),
}

/// Successful response variants.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OkResponse {
    Query {
        ok: bool,
        #[serde(flatten)]
        result: QueryResult,
    },
    Batch {
        ok: bool,
        results: Vec<BatchItem>,
        commit: Option<String>,
    },
    Checkpoint {
        ok: bool,
        commit: Option<Commit>,
    },
    Backup {
        ok: bool,
        backup: FullBackupHandle,
    },
    Size {
        ok: bool,
        size: u64,
    },
    Restore {
        ok: bool,
        restore: RestoreSummary,
    },
    Bytes {
        ok: bool,
        bytes: u64,
    },
    Invalidated {
        ok: bool,
        connections: usize,
    },
    Empty {
        ok: bool,
    },
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl Response {
    pub fn ok_empty() -> Self {
        Response::Ok(OkResponse::Empty { ok: true })
    }

    pub fn ok_query(result: QueryResult) -> Self {
        Response::Ok(OkResponse::Query { ok: true, result })
    }

    pub fn ok_batch(results: Vec<BatchItem>, commit: Option<String>) -> Self {
        Response::Ok(OkResponse::Batch {
            ok: true,
            results,
            commit,
        })
    }

    pub fn ok_checkpoint(commit: Option<Commit>) -> Self {
        Response::Ok(OkResponse::Checkpoint { ok: true, commit })
    }

    pub fn ok_backup(backup: FullBackupHandle) -> Self {
        Response::Ok(OkResponse::Backup { ok: true, backup })
    }

    pub fn ok_size(size: u64) -> Self {
        Response::Ok(OkResponse::Size { ok: true, size })
    }

    pub fn ok_restore(restore: RestoreSummary) -> Self {
        Response::Ok(OkResponse::Restore { ok: true, restore })
    }

    pub fn ok_bytes(bytes: u64) -> Self {
        Response::Ok(OkResponse::Bytes { ok: true, bytes })
    }

    pub fn ok_invalidated(connections: usize) -> Self {
        Response::Ok(OkResponse::Invalidated {
            ok: true,
            connections,
        })
    }

    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            error: error.into(),
            message: message.into(),
        })
    }
}
