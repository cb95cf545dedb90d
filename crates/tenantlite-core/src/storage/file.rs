use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::types::{HEADER_SIZE, PageNumber};

use super::header::DatabaseHeader;
use super::lock::FileLock;

/// Random-access file addressed in fixed-size pages.
///
/// Uses `pread`/`pwrite` (via `FileExt::read_at` / `write_at`), so a single
/// handle can be shared across threads without seek-based state.
#[derive(Debug)]
pub struct PageFile {
    file: File,
    path: PathBuf,
}

impl PageFile {
    /// Open the file at `path`, creating it (and its parent directories)
    /// when `create` is set.
    pub fn open(path: &Path, create: bool) -> Result<Self, StorageError> {
        if create {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file without write access.
    #[cfg(test)]
    pub(crate) fn open_read_only(path: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            file: File::open(path)?,
            path: path.to_path_buf(),
        })
    }

    /// Read into `buf` starting at `offset`. Returns the number of bytes read,
    /// which is less than `buf.len()` only when the end of file was reached.
    /// Bytes past the end of file are zero-filled.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(filled)
    }

    /// Write all of `buf` at `offset`, extending the file if needed.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Current physical length of the file in bytes.
    pub fn len(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    pub fn set_len(&self, size: u64) -> Result<(), StorageError> {
        self.file.set_len(size)?;
        Ok(())
    }

    /// Fsync the underlying file.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Parse the database header, or `None` if the file is shorter than a
    /// header (a database SQLite has not written yet).
    pub fn header(&self) -> Result<Option<DatabaseHeader>, StorageError> {
        let mut buf = [0u8; HEADER_SIZE];
        let n = self.read_at(&mut buf, 0)?;
        if n < HEADER_SIZE {
            return Ok(None);
        }
        DatabaseHeader::from_bytes(&buf).map(Some)
    }

    /// Number of pages the header declares, bounded by the physical size.
    pub fn page_count(&self) -> Result<u32, StorageError> {
        let Some(header) = self.header()? else {
            return Ok(0);
        };
        let physical = self.len()? / u64::from(header.page_size);
        Ok(header.total_pages.min(physical as u32))
    }

    /// Read one full page. Bounds-checked against the header's page count.
    pub fn read_page(
        &self,
        page_number: PageNumber,
        page_size: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let total_pages = self.page_count()?;
        if page_number >= total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_number,
                total_pages,
            });
        }
        let mut buf = vec![0u8; page_size as usize];
        self.read_at(&mut buf, page_offset(page_number, page_size))?;
        Ok(buf)
    }

    /// Write one full page at its offset.
    pub fn write_page(&self, page_number: PageNumber, data: &[u8]) -> Result<(), StorageError> {
        self.write_at(data, page_offset(page_number, data.len() as u32))
    }

    pub fn lock_exclusive(&self) -> Result<FileLock, StorageError> {
        FileLock::exclusive(&self.file)
    }

    pub fn lock_shared(&self) -> Result<FileLock, StorageError> {
        FileLock::shared(&self.file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return a reference to the underlying file handle.
    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Byte offset of `page_number` for the given page size.
pub fn page_offset(page_number: PageNumber, page_size: u32) -> u64 {
    u64::from(page_number) * u64::from(page_size)
}
