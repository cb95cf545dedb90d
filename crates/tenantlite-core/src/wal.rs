//! Dirty-page log: in-memory page overlay for one database file.
//!
//! Every write SQLite issues against the main database lands here instead of
//! on disk. Reads are served from the overlay first, falling through to the
//! file. A checkpoint flushes the overlay to the file in ascending page order
//! and hands the flushed pages to the backup engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{StorageError, WalError};
use crate::storage::{PageFile, page_offset};
use crate::types::{ChangedPages, PageNumber};
use crate::vfs::HandleRegistry;

#[derive(Debug, Default)]
struct WalState {
    pages: BTreeMap<PageNumber, Vec<u8>>,
    /// Logical file size set by a truncate, applied at the next checkpoint.
    truncate_to: Option<u64>,
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    owner: u64,
    page_size: u32,
    handles: Arc<HandleRegistry>,
    state: Mutex<WalState>,
    checkpointing: AtomicBool,
}

/// Clears the checkpointing flag when a checkpoint ends, however it ends.
struct CheckpointGuard<'a>(&'a AtomicBool);

impl Drop for CheckpointGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Wal {
    /// Create an empty log for the database file at `path`. Handles are
    /// opened through `handles` on behalf of `owner`.
    pub fn new(path: PathBuf, page_size: u32, owner: u64, handles: Arc<HandleRegistry>) -> Self {
        Self {
            path,
            owner,
            page_size,
            handles,
            state: Mutex::new(WalState::default()),
            checkpointing: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    fn file(&self) -> Result<Arc<PageFile>, StorageError> {
        self.handles.open(self.owner, &self.path, true)
    }

    /// Buffer `data` at `offset`. Full-page writes replace the page;
    /// partial writes are merged over the page's current content.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<(), StorageError> {
        let page_size = self.page_size as usize;
        let mut state = self.state.lock();
        let mut written = 0;

        while written < data.len() {
            let pos = offset + written as u64;
            let page_number = (pos / page_size as u64) as PageNumber;
            let in_page = (pos % page_size as u64) as usize;
            let take = (page_size - in_page).min(data.len() - written);
            let chunk = &data[written..written + take];

            if in_page == 0 && take == page_size {
                state.pages.insert(page_number, chunk.to_vec());
            } else {
                if !state.pages.contains_key(&page_number) {
                    let mut base = vec![0u8; page_size];
                    let base_offset = page_offset(page_number, self.page_size);
                    self.read_file(&mut base, base_offset, state.truncate_to)?;
                    state.pages.insert(page_number, base);
                }
                if let Some(page) = state.pages.get_mut(&page_number) {
                    page[in_page..in_page + take].copy_from_slice(chunk);
                }
            }
            written += take;
        }
        Ok(())
    }

    /// Read into `buf` from `offset`, preferring buffered pages. Returns the
    /// number of bytes inside the logical file size; the rest of `buf` is
    /// zero-filled.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let page_size = self.page_size as usize;
        let state = self.state.lock();
        let size = self.size_locked(&state)?;
        let mut done = 0;

        while done < buf.len() {
            let pos = offset + done as u64;
            let page_number = (pos / page_size as u64) as PageNumber;
            let in_page = (pos % page_size as u64) as usize;
            let take = (page_size - in_page).min(buf.len() - done);
            let out = &mut buf[done..done + take];

            match state.pages.get(&page_number) {
                Some(page) => out.copy_from_slice(&page[in_page..in_page + take]),
                None => self.read_file(out, pos, state.truncate_to)?,
            }
            done += take;
        }

        let available = size.saturating_sub(offset).min(buf.len() as u64) as usize;
        buf[available..].fill(0);
        Ok(available)
    }

    /// True if the page containing `offset` is buffered.
    pub fn has_page(&self, offset: u64) -> bool {
        let page_number = (offset / u64::from(self.page_size)) as PageNumber;
        self.state.lock().pages.contains_key(&page_number)
    }

    /// Logical size of the database: the file (or pending truncation)
    /// extended by any buffered pages past its end.
    pub fn size(&self) -> Result<u64, StorageError> {
        let state = self.state.lock();
        self.size_locked(&state)
    }

    /// Discard buffered pages at or past `size` and record the truncation
    /// for the next checkpoint.
    pub fn truncate(&self, size: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let first_dropped = size.div_ceil(u64::from(self.page_size)) as PageNumber;
        state.pages.split_off(&first_dropped);
        state.truncate_to = Some(size);
        Ok(())
    }

    /// Number of buffered pages.
    pub fn len(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while a checkpoint is flushing pages.
    pub fn is_checkpointing(&self) -> bool {
        self.checkpointing.load(Ordering::Acquire)
    }

    /// Flush every buffered page to the database file in ascending page
    /// order and return the flushed set. An empty log performs no I/O.
    ///
    /// A concurrent checkpoint is rejected with `CheckpointInProgress`. A
    /// failed write returns `WalError::Fatal` and leaves the buffered pages
    /// in place.
    pub fn checkpoint(&self) -> Result<ChangedPages, WalError> {
        if self
            .checkpointing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WalError::CheckpointInProgress);
        }
        let _guard = CheckpointGuard(&self.checkpointing);

        let mut state = self.state.lock();
        if state.pages.is_empty() && state.truncate_to.is_none() {
            return Ok(ChangedPages::new());
        }

        let file = self.file()?;
        let _lock = file.lock_exclusive()?;

        if let Some(size) = state.truncate_to {
            file.set_len(size).map_err(|source| self.fatal(0, source))?;
        }
        for (&page_number, data) in &state.pages {
            file.write_page(page_number, data)
                .map_err(|source| self.fatal(page_number, source))?;
        }
        file.sync().map_err(|source| self.fatal(0, source))?;

        state.truncate_to = None;
        let changed = std::mem::take(&mut state.pages);
        debug!(path = %self.path.display(), pages = changed.len(), "checkpoint complete");
        Ok(changed)
    }

    fn fatal(&self, page_number: PageNumber, source: StorageError) -> WalError {
        error!(
            fatal = true,
            path = %self.path.display(),
            page_number,
            error = %source,
            "checkpoint write failed"
        );
        WalError::Fatal {
            page_number,
            source,
        }
    }

    fn size_locked(&self, state: &WalState) -> Result<u64, StorageError> {
        let base = match state.truncate_to {
            Some(size) => size,
            None => self.file()?.len()?,
        };
        let buffered_end = state
            .pages
            .last_key_value()
            .map(|(&n, _)| page_offset(n + 1, self.page_size))
            .unwrap_or(0);
        Ok(base.max(buffered_end))
    }

    /// Read from the file, treating bytes at or past a pending truncation
    /// as zero.
    fn read_file(
        &self,
        out: &mut [u8],
        offset: u64,
        truncate_to: Option<u64>,
    ) -> Result<(), StorageError> {
        let limit = truncate_to.unwrap_or(u64::MAX);
        if offset >= limit {
            out.fill(0);
            return Ok(());
        }
        self.file()?.read_at(out, offset)?;
        let visible = (limit - offset).min(out.len() as u64) as usize;
        out[visible..].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const PS: u32 = 512;

    fn wal_in(dir: &TempDir) -> (Wal, Arc<HandleRegistry>) {
        let handles = Arc::new(HandleRegistry::new());
        let wal = Wal::new(dir.path().join("t.db"), PS, 1, Arc::clone(&handles));
        (wal, handles)
    }

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; PS as usize]
    }

    #[test]
    fn test_read_your_own_write() {
        let dir = tempdir().unwrap();
        let (wal, _) = wal_in(&dir);

        wal.write_at(&page(0xAB), 2 * PS as u64).unwrap();
        assert!(wal.has_page(2 * PS as u64));
        assert!(!wal.has_page(PS as u64));

        let mut buf = vec![0u8; PS as usize];
        let n = wal.read_at(&mut buf, 2 * PS as u64).unwrap();
        assert_eq!(n, PS as usize);
        assert_eq!(buf, page(0xAB));

        // Nothing reached the file yet.
        let file = PageFile::open(wal.path(), false).unwrap();
        assert_eq!(file.len().unwrap(), 0);
    }

    #[test]
    fn test_last_write_wins() {
        let dir = tempdir().unwrap();
        let (wal, _) = wal_in(&dir);

        wal.write_at(&page(1), 0).unwrap();
        wal.write_at(&page(2), 0).unwrap();
        assert_eq!(wal.len(), 1);

        let mut buf = vec![0u8; PS as usize];
        wal.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, page(2));
    }

    #[test]
    fn test_partial_write_merges_with_file() {
        let dir = tempdir().unwrap();
        let (wal, handles) = wal_in(&dir);
        let file = handles.open(9, wal.path(), true).unwrap();
        file.write_page(0, &page(7)).unwrap();

        wal.write_at(b"hello", 10).unwrap();

        let mut buf = vec![0u8; PS as usize];
        wal.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[10..15], b"hello");
        assert_eq!(buf[0], 7);
        assert_eq!(buf[20], 7);
    }

    #[test]
    fn test_read_spanning_buffered_and_file_pages() {
        let dir = tempdir().unwrap();
        let (wal, handles) = wal_in(&dir);
        let file = handles.open(9, wal.path(), true).unwrap();
        file.write_page(0, &page(1)).unwrap();
        file.write_page(1, &page(1)).unwrap();

        wal.write_at(&page(2), PS as u64).unwrap();

        let mut buf = vec![0u8; 2 * PS as usize];
        let n = wal.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 2 * PS as usize);
        assert!(buf[..PS as usize].iter().all(|&b| b == 1));
        assert!(buf[PS as usize..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_short_read_past_end() {
        let dir = tempdir().unwrap();
        let (wal, _) = wal_in(&dir);
        wal.write_at(&page(3), 0).unwrap();

        let mut buf = vec![0xFFu8; 100];
        let n = wal.read_at(&mut buf, PS as u64 - 50).unwrap();
        assert_eq!(n, 50);
        assert!(buf[50..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_size_includes_buffered_pages() {
        let dir = tempdir().unwrap();
        let (wal, _) = wal_in(&dir);
        assert_eq!(wal.size().unwrap(), 0);

        wal.write_at(&page(1), 3 * PS as u64).unwrap();
        assert_eq!(wal.size().unwrap(), 4 * PS as u64);
    }

    #[test]
    fn test_checkpoint_empty_is_noop() {
        let dir = tempdir().unwrap();
        let (wal, handles) = wal_in(&dir);

        let changed = wal.checkpoint().unwrap();
        assert!(changed.is_empty());
        // No handle was opened and no file was created.
        assert!(handles.is_empty());
        assert!(!wal.path().exists());
    }

    #[test]
    fn test_checkpoint_writes_pages_in_order() {
        let dir = tempdir().unwrap();
        let (wal, _) = wal_in(&dir);

        for n in [3u32, 0, 2, 1] {
            wal.write_at(&page(n as u8 + 10), u64::from(n) * u64::from(PS)).unwrap();
        }

        let changed = wal.checkpoint().unwrap();
        assert_eq!(changed.len(), 4);
        assert_eq!(changed.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(wal.is_empty());
        assert!(!wal.is_checkpointing());

        let file = PageFile::open(wal.path(), false).unwrap();
        assert_eq!(file.len().unwrap(), 4 * PS as u64);
        let mut buf = vec![0u8; PS as usize];
        for n in 0..4u32 {
            file.read_at(&mut buf, u64::from(n) * u64::from(PS)).unwrap();
            assert_eq!(buf, page(n as u8 + 10));
        }

        // A second checkpoint has nothing to flush.
        assert!(wal.checkpoint().unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_uses_registry_handle() {
        let dir = tempdir().unwrap();
        let (wal, handles) = wal_in(&dir);
        wal.write_at(&page(5), 0).unwrap();
        wal.checkpoint().unwrap();
        assert!(handles.is_open(wal.path()));
    }

    #[test]
    fn test_truncate_drops_pages_and_applies_on_checkpoint() {
        let dir = tempdir().unwrap();
        let (wal, handles) = wal_in(&dir);
        let file = handles.open(9, wal.path(), true).unwrap();
        for n in 0..4 {
            file.write_page(n, &page(1)).unwrap();
        }

        wal.write_at(&page(2), 3 * PS as u64).unwrap();
        wal.truncate(2 * PS as u64).unwrap();
        assert!(wal.is_empty());
        assert_eq!(wal.size().unwrap(), 2 * PS as u64);

        let mut buf = vec![0xFFu8; PS as usize];
        assert_eq!(wal.read_at(&mut buf, 2 * PS as u64).unwrap(), 0);
        assert!(buf.iter().all(|&b| b == 0));

        let changed = wal.checkpoint().unwrap();
        assert!(changed.is_empty());
        assert_eq!(file.len().unwrap(), 2 * PS as u64);
    }

    #[test]
    fn test_concurrent_checkpoint_rejected() {
        let dir = tempdir().unwrap();
        let (wal, _) = wal_in(&dir);
        wal.write_at(&page(1), 0).unwrap();

        wal.checkpointing.store(true, Ordering::Release);
        assert!(wal.is_checkpointing());
        match wal.checkpoint() {
            Err(WalError::CheckpointInProgress) => {}
            other => panic!("expected CheckpointInProgress, got {other:?}"),
        }
        // The rejected call must not clear the in-flight flag.
        assert!(wal.is_checkpointing());
        wal.checkpointing.store(false, Ordering::Release);
        assert_eq!(wal.checkpoint().unwrap().len(), 1);
    }
}
