//! Error types for all TenantLite operations.

use std::io;

use serde::Serialize;
use thiserror::Error;

use crate::auth::Privilege;
use crate::types::PageNumber;

/// Top-level error type for TenantLite operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("access denied for access key '{0}'")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// True for failures that leave no recoverable state for the current
    /// operation: checkpoint and backup write errors.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Wal(WalError::Fatal { .. }) | Error::Backup(BackupError::Io { .. })
        )
    }

    /// Stable error name used in client-facing responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "StorageError",
            Error::Wal(WalError::CheckpointInProgress) => "CheckpointInProgress",
            Error::Wal(_) => "IoFatal",
            Error::Backup(BackupError::Io { .. }) => "IoFatal",
            Error::Backup(_) => "BackupError",
            Error::Privilege(_) => "PrivilegeError",
            Error::Validation(_) => "ValidationError",
            Error::Engine(_) => "EngineError",
            Error::AccessDenied(_) => "AccessDenied",
            Error::NotFound(_) => "NotFound",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid database header magic")]
    InvalidMagic,

    #[error("invalid page size: {0}")]
    InvalidPageSize(u32),

    #[error("database header is truncated: {0} bytes")]
    TruncatedHeader(usize),

    #[error("page out of bounds: {page_number} >= {total_pages}")]
    PageOutOfBounds {
        page_number: PageNumber,
        total_pages: u32,
    },

    #[error("database file is locked")]
    FileLocked,
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("a checkpoint is already in progress")]
    CheckpointInProgress,

    #[error("checkpoint failed writing page {page_number}: {source}")]
    Fatal {
        page_number: PageNumber,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup write failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("invalid backup object: {0}")]
    InvalidObject(String),

    #[error("object storage error: {0}")]
    ObjectStorage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BackupError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        BackupError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// A statement action denied by the caller's access key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not authorized: {verb} privilege is required")]
pub struct PrivilegeError {
    pub verb: Privilege,
}

impl PrivilegeError {
    pub fn new(verb: Privilege) -> Self {
        Self { verb }
    }
}

/// One invalid field in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {}", format_fields(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError {
                field: field.into(),
                message: message.into(),
            }],
        }
    }
}

fn format_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to register VFS '{name}': sqlite code {code}")]
    VfsRegistration { name: String, code: i32 },

    #[error("connection is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
