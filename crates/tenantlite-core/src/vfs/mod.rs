//! Virtual file system shim between SQLite and tenant storage.
//!
//! SQLite addresses files by logical name. The shim resolves journal names
//! to a scratch directory and everything else to tenant storage, hands out
//! cached handles, and routes the main database through the connection's
//! dirty-page log. The FFI registration that exposes this to SQLite lives in
//! [`crate::engine::ffi`].

pub mod file;
pub mod registry;

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StorageError;
use crate::wal::Wal;

pub use file::VfsFile;
pub use registry::HandleRegistry;

/// Suffixes SQLite appends to a database name for its side files.
const JOURNAL_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// How SQLite asked for a file to be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub main_database: bool,
    pub create: bool,
    pub delete_on_close: bool,
}

/// The question asked by an `access` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessQuery {
    Exists,
    ReadWrite,
    Read,
}

/// True for journal, WAL and shared-memory side-file names.
pub fn is_journal_name(name: &str) -> bool {
    JOURNAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Per-connection VFS state.
#[derive(Debug)]
pub struct VfsShim {
    id: u64,
    storage_dir: PathBuf,
    scratch_dir: PathBuf,
    database_path: PathBuf,
    handles: Arc<HandleRegistry>,
    wal: Arc<Wal>,
    temp_files: AtomicU64,
}

impl VfsShim {
    /// Create the shim for the logical database `database_name`, which
    /// resolves under `storage_dir`.
    pub fn new(
        id: u64,
        storage_dir: PathBuf,
        scratch_dir: PathBuf,
        database_name: &str,
        page_size: u32,
        handles: Arc<HandleRegistry>,
    ) -> Self {
        let database_path = storage_path(&storage_dir, database_name);
        let wal = Arc::new(Wal::new(
            database_path.clone(),
            page_size,
            id,
            Arc::clone(&handles),
        ));
        Self {
            id,
            storage_dir,
            scratch_dir,
            database_path,
            handles,
            wal,
            temp_files: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    /// Map a logical name to its on-disk location.
    pub fn resolve(&self, name: &str) -> PathBuf {
        if is_journal_name(name) {
            self.scratch_dir.join(relative(name))
        } else {
            self.storage_dir.join(relative(name))
        }
    }

    /// Open `name` (or an anonymous temp file when `name` is `None`).
    pub fn open(&self, name: Option<&str>, mode: OpenMode) -> Result<VfsFile, StorageError> {
        let (path, delete_on_close) = match name {
            Some(name) => (self.resolve(name), mode.delete_on_close),
            None => {
                let n = self.temp_files.fetch_add(1, Ordering::Relaxed);
                (self.scratch_dir.join(format!("temp-{}-{n}", self.id)), true)
            }
        };

        let file = self.handles.open(self.id, &path, mode.create || name.is_none())?;
        let wal = (mode.main_database && path == self.database_path).then(|| Arc::clone(&self.wal));

        Ok(VfsFile::new(
            path,
            file,
            wal,
            delete_on_close,
            Arc::clone(&self.handles),
        ))
    }

    /// Remove the file behind `name`. A missing file is not an error.
    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.resolve(name);
        self.handles.forget(&path);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Journal and WAL side files never exist as far as SQLite is concerned;
    /// there is no on-disk journal to recover. Existence queries check the
    /// resolved file, capability queries always succeed.
    pub fn access(&self, name: &str, query: AccessQuery) -> bool {
        if is_journal_name(name) {
            return false;
        }
        match query {
            AccessQuery::Exists => self.resolve(name).exists(),
            AccessQuery::ReadWrite | AccessQuery::Read => true,
        }
    }

    /// Force-close every handle this connection opened.
    pub fn close_all(&self) -> usize {
        self.handles.close_owner(self.id)
    }
}

/// Location of the logical file `name` below `storage_dir`.
pub fn storage_path(storage_dir: &Path, name: &str) -> PathBuf {
    storage_dir.join(relative(name))
}

/// Strip root and parent components so a logical name always stays below
/// the directory it is joined to.
fn relative(name: &str) -> PathBuf {
    Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
