use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::StorageError;
use crate::storage::PageFile;
use crate::wal::Wal;

use super::HandleRegistry;

/// A file handle returned by the VFS shim.
///
/// Main-database handles route all page I/O through the connection's
/// dirty-page log; every other handle reads and writes the cached file
/// directly.
#[derive(Debug)]
pub struct VfsFile {
    path: PathBuf,
    file: Arc<PageFile>,
    wal: Option<Arc<Wal>>,
    delete_on_close: bool,
    handles: Arc<HandleRegistry>,
}

impl VfsFile {
    pub(crate) fn new(
        path: PathBuf,
        file: Arc<PageFile>,
        wal: Option<Arc<Wal>>,
        delete_on_close: bool,
        handles: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            path,
            file,
            wal,
            delete_on_close,
            handles,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_main_database(&self) -> bool {
        self.wal.is_some()
    }

    /// Read into `buf` at `offset`. Returns the number of bytes that exist;
    /// the remainder of `buf` is zero-filled.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        match &self.wal {
            Some(wal) => wal.read_at(buf, offset),
            None => self.file.read_at(buf, offset),
        }
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<(), StorageError> {
        match &self.wal {
            Some(wal) => wal.write_at(data, offset),
            None => self.file.write_at(data, offset),
        }
    }

    pub fn size(&self) -> Result<u64, StorageError> {
        match &self.wal {
            Some(wal) => wal.size(),
            None => self.file.len(),
        }
    }

    pub fn truncate(&self, size: u64) -> Result<(), StorageError> {
        match &self.wal {
            Some(wal) => wal.truncate(size),
            None => self.file.set_len(size),
        }
    }

    /// Main-database durability comes from checkpoints, so only scratch
    /// files are synced here.
    pub fn sync(&self) -> Result<(), StorageError> {
        match &self.wal {
            Some(_) => Ok(()),
            None => self.file.sync(),
        }
    }

    /// Release this handle, deleting the file if it was opened
    /// delete-on-close. The cached handle itself stays open.
    pub fn close(self) {
        if self.delete_on_close {
            self.handles.forget(&self.path);
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
                }
            }
        }
    }
}
