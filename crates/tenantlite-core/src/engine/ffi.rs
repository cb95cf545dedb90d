//! SQLite VFS registration.
//!
//! Each connection registers its own VFS whose `pAppData` points at the
//! connection's [`VfsShim`]. Every callback here converts raw pointers into
//! shim calls and shim errors into SQLite result codes; nothing else in the
//! crate touches the FFI surface.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::mem;
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::ffi;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::vfs::{AccessQuery, OpenMode, VfsFile, VfsShim};

/// SQLite keeps one process-wide VFS list, so names must be unique across
/// every context in the process.
static NEXT_VFS_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_vfs_id() -> u64 {
    NEXT_VFS_ID.fetch_add(1, Ordering::Relaxed)
}

/// The file object SQLite allocates (`szOsFile` bytes) for each open file.
#[repr(C)]
struct ShimFile {
    base: ffi::sqlite3_file,
    handle: *mut VfsFile,
}

/// A registered VFS. Unregisters and frees itself on drop; the SQLite
/// connection using it must be closed first.
#[derive(Debug)]
pub struct VfsRegistration {
    vfs: *mut ffi::sqlite3_vfs,
    name: CString,
}

// The raw pointer is only dereferenced by SQLite and by `Drop`.
unsafe impl Send for VfsRegistration {}

impl VfsRegistration {
    /// Register a VFS named `tenantlite-<id>` serving `shim`.
    pub fn register(shim: Arc<VfsShim>) -> Result<Self, EngineError> {
        let name_str = format!("tenantlite-{}", shim.id());
        let name = CString::new(name_str.clone()).map_err(|_| EngineError::VfsRegistration {
            name: name_str.clone(),
            code: ffi::SQLITE_MISUSE,
        })?;

        // SAFETY: `sqlite3_vfs_find(NULL)` returns the default VFS, which
        // lives for the whole process. We copy it so the dynamic-loading,
        // randomness, sleep and clock methods keep their defaults.
        let default = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
        if default.is_null() {
            return Err(EngineError::VfsRegistration {
                name: name_str,
                code: ffi::SQLITE_ERROR,
            });
        }
        let mut vfs: ffi::sqlite3_vfs = unsafe { ptr::read(default) };
        vfs.iVersion = 2;
        vfs.szOsFile = mem::size_of::<ShimFile>() as c_int;
        vfs.pNext = ptr::null_mut();
        vfs.zName = name.as_ptr();
        vfs.pAppData = Arc::into_raw(shim) as *mut c_void;
        vfs.xOpen = Some(x_open);
        vfs.xDelete = Some(x_delete);
        vfs.xAccess = Some(x_access);
        vfs.xFullPathname = Some(x_full_pathname);

        let vfs = Box::into_raw(Box::new(vfs));
        // SAFETY: `vfs` is a valid, heap-allocated VFS that outlives its
        // registration (freed only after unregistering in `Drop`).
        let code = unsafe { ffi::sqlite3_vfs_register(vfs, 0) };
        if code != ffi::SQLITE_OK {
            // SAFETY: registration failed, so SQLite holds no reference.
            unsafe { free_vfs(vfs) };
            return Err(EngineError::VfsRegistration {
                name: name_str,
                code,
            });
        }
        debug!(vfs = %name_str, "vfs registered");
        Ok(Self { vfs, name })
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }
}

impl Drop for VfsRegistration {
    fn drop(&mut self) {
        // SAFETY: `self.vfs` was registered by `register` and every
        // connection using it has been closed.
        unsafe {
            ffi::sqlite3_vfs_unregister(self.vfs);
            free_vfs(self.vfs);
        }
    }
}

/// Free a VFS allocated by `register`, releasing its shim reference.
unsafe fn free_vfs(vfs: *mut ffi::sqlite3_vfs) {
    unsafe {
        let vfs = Box::from_raw(vfs);
        drop(Arc::from_raw(vfs.pAppData as *const VfsShim));
    }
}

unsafe fn shim<'a>(vfs: *mut ffi::sqlite3_vfs) -> &'a VfsShim {
    unsafe { &*((*vfs).pAppData as *const VfsShim) }
}

unsafe fn file_handle<'a>(file: *mut ffi::sqlite3_file) -> Option<&'a VfsFile> {
    unsafe { (*(file as *mut ShimFile)).handle.as_ref() }
}

unsafe fn c_name<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(name) }.to_str().ok()
}

unsafe extern "C" fn x_open(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    unsafe {
        let out = file as *mut ShimFile;
        (*out).base.pMethods = ptr::null();
        (*out).handle = ptr::null_mut();

        let name = if name.is_null() {
            None
        } else {
            match c_name(name) {
                Some(name) => Some(name),
                None => return ffi::SQLITE_CANTOPEN,
            }
        };
        let mode = OpenMode {
            main_database: flags & ffi::SQLITE_OPEN_MAIN_DB != 0,
            create: flags & ffi::SQLITE_OPEN_CREATE != 0,
            delete_on_close: flags & ffi::SQLITE_OPEN_DELETEONCLOSE != 0,
        };

        match shim(vfs).open(name, mode) {
            Ok(handle) => {
                (*out).handle = Box::into_raw(Box::new(handle));
                (*out).base.pMethods = &IO_METHODS;
                if !out_flags.is_null() {
                    *out_flags = flags;
                }
                ffi::SQLITE_OK
            }
            Err(e) => {
                warn!(name = name.unwrap_or("<temp>"), error = %e, "vfs open failed");
                ffi::SQLITE_CANTOPEN
            }
        }
    }
}

unsafe extern "C" fn x_delete(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    unsafe {
        let Some(name) = c_name(name) else {
            return ffi::SQLITE_IOERR_DELETE;
        };
        match shim(vfs).delete(name) {
            Ok(()) => ffi::SQLITE_OK,
            Err(e) => {
                warn!(name, error = %e, "vfs delete failed");
                ffi::SQLITE_IOERR_DELETE
            }
        }
    }
}

unsafe extern "C" fn x_access(
    vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    flags: c_int,
    out: *mut c_int,
) -> c_int {
    unsafe {
        let Some(name) = c_name(name) else {
            *out = 0;
            return ffi::SQLITE_OK;
        };
        let query = match flags {
            ffi::SQLITE_ACCESS_EXISTS => AccessQuery::Exists,
            ffi::SQLITE_ACCESS_READWRITE => AccessQuery::ReadWrite,
            _ => AccessQuery::Read,
        };
        *out = c_int::from(shim(vfs).access(name, query));
        ffi::SQLITE_OK
    }
}

/// Logical names are used as-is; the shim resolves them.
unsafe extern "C" fn x_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    n_out: c_int,
    out: *mut c_char,
) -> c_int {
    unsafe {
        if name.is_null() || n_out <= 0 {
            return ffi::SQLITE_CANTOPEN;
        }
        let bytes = CStr::from_ptr(name).to_bytes_with_nul();
        if bytes.len() > n_out as usize {
            return ffi::SQLITE_CANTOPEN;
        }
        ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
        ffi::SQLITE_OK
    }
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_lock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    unsafe {
        let shim_file = file as *mut ShimFile;
        let handle = (*shim_file).handle;
        (*shim_file).handle = ptr::null_mut();
        if !handle.is_null() {
            Box::from_raw(handle).close();
        }
        ffi::SQLITE_OK
    }
}

unsafe extern "C" fn x_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amount: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    unsafe {
        let Some(handle) = file_handle(file) else {
            return ffi::SQLITE_IOERR_READ;
        };
        let out = slice::from_raw_parts_mut(buf as *mut u8, amount as usize);
        match handle.read_at(out, offset as u64) {
            Ok(n) if n == out.len() => ffi::SQLITE_OK,
            Ok(_) => ffi::SQLITE_IOERR_SHORT_READ,
            Err(e) => {
                warn!(path = %handle.path().display(), offset, error = %e, "vfs read failed");
                ffi::SQLITE_IOERR_READ
            }
        }
    }
}

unsafe extern "C" fn x_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amount: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    unsafe {
        let Some(handle) = file_handle(file) else {
            return ffi::SQLITE_IOERR_WRITE;
        };
        let data = slice::from_raw_parts(buf as *const u8, amount as usize);
        match handle.write_at(data, offset as u64) {
            Ok(()) => ffi::SQLITE_OK,
            Err(e) => {
                warn!(path = %handle.path().display(), offset, error = %e, "vfs write failed");
                ffi::SQLITE_IOERR_WRITE
            }
        }
    }
}

unsafe extern "C" fn x_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    unsafe {
        match file_handle(file).map(|h| h.truncate(size as u64)) {
            Some(Ok(())) => ffi::SQLITE_OK,
            _ => ffi::SQLITE_IOERR_TRUNCATE,
        }
    }
}

unsafe extern "C" fn x_sync(file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    unsafe {
        match file_handle(file).map(|h| h.sync()) {
            Some(Ok(())) => ffi::SQLITE_OK,
            _ => ffi::SQLITE_IOERR_FSYNC,
        }
    }
}

unsafe extern "C" fn x_file_size(
    file: *mut ffi::sqlite3_file,
    size: *mut ffi::sqlite3_int64,
) -> c_int {
    unsafe {
        match file_handle(file).map(|h| h.size()) {
            Some(Ok(n)) => {
                *size = n as ffi::sqlite3_int64;
                ffi::SQLITE_OK
            }
            _ => ffi::SQLITE_IOERR_FSTAT,
        }
    }
}

/// Writers are serialized by the resolver's gate, so file locks are no-ops.
unsafe extern "C" fn x_lock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_check_reserved_lock(
    _file: *mut ffi::sqlite3_file,
    out: *mut c_int,
) -> c_int {
    unsafe {
        *out = 0;
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_file_control(
    _file: *mut ffi::sqlite3_file,
    _op: c_int,
    _arg: *mut c_void,
) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn x_sector_size(_file: *mut ffi::sqlite3_file) -> c_int {
    4096
}

unsafe extern "C" fn x_device_characteristics(_file: *mut ffi::sqlite3_file) -> c_int {
    0
}
