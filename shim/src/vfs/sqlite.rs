//! Bridge between the [`Vfs`] traits and SQLite's C plugin ABI.
//!
//! [`NativeVfs`] drives a VFS that SQLite already knows about (normally
//! `unix` or `win32`) through the traits; [`register_vfs`] goes the other
//! way and hands any trait implementation to SQLite. [`register_shim`] uses
//! both to put a [`ShimVfs`] in front of the engine's default VFS.

use super::fail::WriteFailFlag;
use super::shim::{ShimOptions, ShimVfs};
use super::{
    check, code, status, AccessCheck, BoxedFile, DlHandle, DlSymbol, FileControl, LockLevel,
    MappedPage, OpenFlags, Pathname, SharedVfs, ShmRegion, SyscallPtr, Vfs, VfsError, VfsFile,
    VfsResult, DEFAULT_SECTOR_SIZE, FCNTL_VFSNAME,
};
use parking_lot::Mutex;
use rusqlite::ffi;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::mem::{self, size_of};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A VFS registered with SQLite, driven through the [`Vfs`] trait.
pub struct NativeVfs {
    raw: NonNull<ffi::sqlite3_vfs>,
    name: String,
}

// SQLite's built-in VFS implementations are safe to call from any thread.
unsafe impl Send for NativeVfs {}
unsafe impl Sync for NativeVfs {}

impl NativeVfs {
    /// Look up a registered VFS; `None` selects SQLite's current default.
    pub fn find(name: Option<&str>) -> VfsResult<Option<Self>> {
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(|_| VfsError::Misuse)?;
        let raw = unsafe { ffi::sqlite3_vfs_find(name.as_ref().map_or(ptr::null(), |n| n.as_ptr())) };
        Ok(NonNull::new(raw).map(|raw| unsafe { Self::from_raw(raw) }))
    }

    /// # Safety
    ///
    /// `raw` must point to a VFS that stays registered for the lifetime of
    /// the returned value.
    pub unsafe fn from_raw(raw: NonNull<ffi::sqlite3_vfs>) -> Self {
        let z_name = raw.as_ref().zName;
        let name = if z_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(z_name).to_string_lossy().into_owned()
        };
        Self { raw, name }
    }

    fn methods(&self) -> &ffi::sqlite3_vfs {
        unsafe { self.raw.as_ref() }
    }

    fn as_ptr(&self) -> *mut ffi::sqlite3_vfs {
        self.raw.as_ptr()
    }

    fn version(&self) -> c_int {
        self.methods().iVersion
    }
}

fn name_ptr(name: Option<&CStr>) -> *const c_char {
    name.map_or(ptr::null(), CStr::as_ptr)
}

/// Read a NUL-terminated message out of a scratch buffer.
fn message_from(buf: &[u8]) -> String {
    CStr::from_bytes_until_nul(buf)
        .map(|msg| msg.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(buf).into_owned())
}

impl Vfs for NativeVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_pathname(&self) -> usize {
        self.methods().mxPathname.max(0) as usize
    }

    fn open(&self, name: Option<&CStr>, flags: OpenFlags) -> VfsResult<(BoxedFile, OpenFlags)> {
        let x_open = self.methods().xOpen.ok_or(VfsError::Misuse)?;
        let mut file = NativeFile::alloc(self.methods().szOsFile);
        let mut out_flags: c_int = 0;

        let rc = unsafe {
            x_open(
                self.as_ptr(),
                name_ptr(name),
                file.as_ptr(),
                flags.bits(),
                &mut out_flags,
            )
        };
        // A failed open may still have installed methods; dropping `file`
        // closes it in that case.
        check(rc)?;
        Ok((Box::new(file), OpenFlags::from_bits_retain(out_flags)))
    }

    fn delete(&self, name: &CStr, sync_dir: bool) -> VfsResult<()> {
        let x_delete = self.methods().xDelete.ok_or(VfsError::Misuse)?;
        check(unsafe { x_delete(self.as_ptr(), name.as_ptr(), sync_dir as c_int) })
    }

    fn access(&self, name: &CStr, access: AccessCheck) -> VfsResult<bool> {
        let x_access = self.methods().xAccess.ok_or(VfsError::Misuse)?;
        let mut res: c_int = 0;
        check(unsafe { x_access(self.as_ptr(), name.as_ptr(), access.as_raw(), &mut res) })?;
        Ok(res != 0)
    }

    fn full_pathname(&self, name: &CStr, max_len: usize) -> VfsResult<Pathname> {
        let x_full_pathname = self.methods().xFullPathname.ok_or(VfsError::Misuse)?;
        let mut buf = vec![0u8; max_len.max(1)];
        let rc = unsafe {
            x_full_pathname(
                self.as_ptr(),
                name.as_ptr(),
                buf.len() as c_int,
                buf.as_mut_ptr().cast(),
            )
        };
        let via_symlink = rc == code::OK_SYMLINK;
        if !via_symlink {
            check(rc)?;
        }
        let path = CStr::from_bytes_until_nul(&buf)
            .map_err(|_| VfsError::CantOpen)?
            .to_owned();
        Ok(Pathname { path, via_symlink })
    }

    fn dl_open(&self, filename: Option<&CStr>) -> Option<DlHandle> {
        let x_dl_open = self.methods().xDlOpen?;
        NonNull::new(unsafe { x_dl_open(self.as_ptr(), name_ptr(filename)) })
    }

    fn dl_error(&self, max_len: usize) -> String {
        let Some(x_dl_error) = self.methods().xDlError else {
            return String::new();
        };
        let mut buf = vec![0u8; max_len.max(1)];
        unsafe { x_dl_error(self.as_ptr(), buf.len() as c_int, buf.as_mut_ptr().cast()) };
        message_from(&buf)
    }

    fn dl_sym(&self, handle: DlHandle, symbol: &CStr) -> Option<DlSymbol> {
        let x_dl_sym = self.methods().xDlSym?;
        unsafe {
            let sym = x_dl_sym(self.as_ptr(), handle.as_ptr(), symbol.as_ptr());
            // The binding's return type varies between bindgen versions; it is
            // always a nullable code pointer.
            mem::transmute::<_, Option<DlSymbol>>(sym)
        }
    }

    fn dl_close(&self, handle: DlHandle) {
        if let Some(x_dl_close) = self.methods().xDlClose {
            unsafe { x_dl_close(self.as_ptr(), handle.as_ptr()) }
        }
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        let Some(x_randomness) = self.methods().xRandomness else {
            return 0;
        };
        let n = unsafe {
            x_randomness(self.as_ptr(), buf.len() as c_int, buf.as_mut_ptr().cast())
        };
        n.max(0) as usize
    }

    fn sleep(&self, duration: Duration) -> Duration {
        let Some(x_sleep) = self.methods().xSleep else {
            return Duration::ZERO;
        };
        let micros = duration.as_micros().min(c_int::MAX as u128) as c_int;
        let slept = unsafe { x_sleep(self.as_ptr(), micros) };
        Duration::from_micros(slept.max(0) as u64)
    }

    fn current_time(&self) -> VfsResult<f64> {
        let x_current_time = self.methods().xCurrentTime.ok_or(VfsError::Misuse)?;
        let mut day = 0f64;
        check(unsafe { x_current_time(self.as_ptr(), &mut day) })?;
        Ok(day)
    }

    fn current_time_i64(&self) -> VfsResult<i64> {
        match self.methods().xCurrentTimeInt64 {
            Some(x_current_time_i64) if self.version() >= 2 => {
                let mut millis: ffi::sqlite3_int64 = 0;
                check(unsafe { x_current_time_i64(self.as_ptr(), &mut millis) })?;
                Ok(millis)
            }
            _ => self
                .current_time()
                .map(|day| (day * 86_400_000.0) as i64),
        }
    }

    fn last_error(&self, max_len: usize) -> (i32, String) {
        let Some(x_get_last_error) = self.methods().xGetLastError else {
            return (0, String::new());
        };
        let mut buf = vec![0u8; max_len.max(1)];
        let rc = unsafe {
            x_get_last_error(self.as_ptr(), buf.len() as c_int, buf.as_mut_ptr().cast())
        };
        (rc, message_from(&buf))
    }

    fn set_system_call(&self, name: Option<&CStr>, ptr: Option<SyscallPtr>) -> VfsResult<()> {
        match self.methods().xSetSystemCall {
            Some(x_set) if self.version() >= 3 => {
                check(unsafe { x_set(self.as_ptr(), name_ptr(name), ptr) })
            }
            _ => Err(VfsError::NotFound),
        }
    }

    fn get_system_call(&self, name: &CStr) -> Option<SyscallPtr> {
        match self.methods().xGetSystemCall {
            Some(x_get) if self.version() >= 3 => unsafe { x_get(self.as_ptr(), name.as_ptr()) },
            _ => None,
        }
    }

    fn next_system_call(&self, name: Option<&CStr>) -> Option<&'static CStr> {
        match self.methods().xNextSystemCall {
            Some(x_next) if self.version() >= 3 => {
                let next = unsafe { x_next(self.as_ptr(), name_ptr(name)) };
                // System call names are static strings inside the VFS.
                (!next.is_null()).then(|| unsafe { CStr::from_ptr(next) })
            }
            _ => None,
        }
    }
}

/// A file opened by a [`NativeVfs`].
///
/// Owns the `szOsFile`-sized block the native VFS keeps its state in. The
/// block lives on the heap so it never moves while the native VFS holds
/// pointers into it.
pub struct NativeFile {
    block: Box<[u64]>,
}

// The native file is only ever used by one caller at a time.
unsafe impl Send for NativeFile {}

impl NativeFile {
    fn alloc(size: c_int) -> Self {
        let bytes = (size.max(0) as usize).max(size_of::<ffi::sqlite3_file>());
        let words = bytes.div_ceil(size_of::<u64>());
        Self {
            block: vec![0u64; words].into_boxed_slice(),
        }
    }

    fn as_ptr(&mut self) -> *mut ffi::sqlite3_file {
        self.block.as_mut_ptr().cast()
    }

    fn io(&self) -> Option<&ffi::sqlite3_io_methods> {
        unsafe { (*self.block.as_ptr().cast::<ffi::sqlite3_file>()).pMethods.as_ref() }
    }

    fn io_method<T>(&self, pick: impl FnOnce(&ffi::sqlite3_io_methods) -> Option<T>) -> Option<T> {
        self.io().and_then(pick)
    }

    fn io_version(&self) -> c_int {
        self.io().map_or(0, |io| io.iVersion)
    }

    /// Close the native file if it is open. Returns SQLite's status.
    fn release(&mut self) -> c_int {
        let Some(x_close) = self.io_method(|io| io.xClose) else {
            return ffi::SQLITE_OK;
        };
        let file = self.as_ptr();
        unsafe {
            let rc = x_close(file);
            (*file).pMethods = ptr::null();
            rc
        }
    }
}

impl Drop for NativeFile {
    fn drop(&mut self) {
        let rc = self.release();
        if rc != ffi::SQLITE_OK {
            warn!(rc, "native file close failed during drop");
        }
    }
}

impl VfsFile for NativeFile {
    fn close(mut self: Box<Self>) -> VfsResult<()> {
        check(self.release())
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<()> {
        let x_read = self.io_method(|io| io.xRead).ok_or(VfsError::Misuse)?;
        check(unsafe {
            x_read(
                self.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len() as c_int,
                offset as ffi::sqlite3_int64,
            )
        })
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> VfsResult<()> {
        let x_write = self.io_method(|io| io.xWrite).ok_or(VfsError::Misuse)?;
        check(unsafe {
            x_write(
                self.as_ptr(),
                buf.as_ptr().cast(),
                buf.len() as c_int,
                offset as ffi::sqlite3_int64,
            )
        })
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        let x_truncate = self.io_method(|io| io.xTruncate).ok_or(VfsError::Misuse)?;
        check(unsafe { x_truncate(self.as_ptr(), size as ffi::sqlite3_int64) })
    }

    fn sync(&mut self, flags: i32) -> VfsResult<()> {
        let x_sync = self.io_method(|io| io.xSync).ok_or(VfsError::Misuse)?;
        check(unsafe { x_sync(self.as_ptr(), flags) })
    }

    fn file_size(&mut self) -> VfsResult<u64> {
        let x_file_size = self.io_method(|io| io.xFileSize).ok_or(VfsError::Misuse)?;
        let mut size: ffi::sqlite3_int64 = 0;
        check(unsafe { x_file_size(self.as_ptr(), &mut size) })?;
        Ok(size as u64)
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<()> {
        let x_lock = self.io_method(|io| io.xLock).ok_or(VfsError::Misuse)?;
        check(unsafe { x_lock(self.as_ptr(), level.as_raw()) })
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        let x_unlock = self.io_method(|io| io.xUnlock).ok_or(VfsError::Misuse)?;
        check(unsafe { x_unlock(self.as_ptr(), level.as_raw()) })
    }

    fn check_reserved_lock(&mut self) -> VfsResult<bool> {
        let x_check = self
            .io_method(|io| io.xCheckReservedLock)
            .ok_or(VfsError::Misuse)?;
        let mut res: c_int = 0;
        check(unsafe { x_check(self.as_ptr(), &mut res) })?;
        Ok(res != 0)
    }

    fn file_control(&mut self, ctl: FileControl<'_>) -> VfsResult<()> {
        let x_file_control = self
            .io_method(|io| io.xFileControl)
            .ok_or(VfsError::NotFound)?;
        match ctl {
            FileControl::VfsName(reply) => {
                let mut name = match reply.take() {
                    Some(prev) => sqlite_string(&prev)?,
                    None => ptr::null_mut(),
                };
                let rc = unsafe {
                    x_file_control(
                        self.as_ptr(),
                        FCNTL_VFSNAME,
                        (&mut name as *mut *mut c_char).cast(),
                    )
                };
                *reply = unsafe { take_sqlite_string(name) };
                check(rc)
            }
            FileControl::Raw { op, arg } => check(unsafe { x_file_control(self.as_ptr(), op, arg) }),
        }
    }

    fn sector_size(&mut self) -> i32 {
        match self.io_method(|io| io.xSectorSize) {
            Some(x_sector_size) => unsafe { x_sector_size(self.as_ptr()) },
            None => DEFAULT_SECTOR_SIZE,
        }
    }

    fn device_characteristics(&mut self) -> i32 {
        match self.io_method(|io| io.xDeviceCharacteristics) {
            Some(x_device) => unsafe { x_device(self.as_ptr()) },
            None => 0,
        }
    }

    fn shm_map(
        &mut self,
        region: i32,
        size: i32,
        extend: bool,
        out: &mut Option<ShmRegion>,
    ) -> VfsResult<()> {
        let x_shm_map = self
            .io_method(|io| io.xShmMap)
            .filter(|_| self.io_version() >= 2)
            .ok_or(VfsError::Code(code::IOERR_SHMMAP))?;
        let mut mapped: *mut c_void = ptr::null_mut();
        let rc = unsafe { x_shm_map(self.as_ptr(), region, size, extend as c_int, &mut mapped) };
        *out = NonNull::new(mapped);
        check(rc)
    }

    fn shm_lock(&mut self, offset: i32, count: i32, flags: i32) -> VfsResult<()> {
        let x_shm_lock = self
            .io_method(|io| io.xShmLock)
            .filter(|_| self.io_version() >= 2)
            .ok_or(VfsError::Code(code::IOERR_SHMLOCK))?;
        check(unsafe { x_shm_lock(self.as_ptr(), offset, count, flags) })
    }

    fn shm_barrier(&mut self) {
        if let Some(x_shm_barrier) = self
            .io_method(|io| io.xShmBarrier)
            .filter(|_| self.io_version() >= 2)
        {
            unsafe { x_shm_barrier(self.as_ptr()) }
        }
    }

    fn shm_unmap(&mut self, delete: bool) -> VfsResult<()> {
        match self
            .io_method(|io| io.xShmUnmap)
            .filter(|_| self.io_version() >= 2)
        {
            Some(x_shm_unmap) => check(unsafe { x_shm_unmap(self.as_ptr(), delete as c_int) }),
            None => Ok(()),
        }
    }

    fn fetch(&mut self, offset: u64, amount: i32) -> VfsResult<Option<MappedPage>> {
        let Some(x_fetch) = self
            .io_method(|io| io.xFetch)
            .filter(|_| self.io_version() >= 3)
        else {
            return Ok(None);
        };
        let mut page: *mut c_void = ptr::null_mut();
        check(unsafe {
            x_fetch(
                self.as_ptr(),
                offset as ffi::sqlite3_int64,
                amount,
                &mut page,
            )
        })?;
        Ok(NonNull::new(page))
    }

    fn unfetch(&mut self, offset: u64, page: Option<MappedPage>) -> VfsResult<()> {
        let Some(x_unfetch) = self
            .io_method(|io| io.xUnfetch)
            .filter(|_| self.io_version() >= 3)
        else {
            return Ok(());
        };
        let page = page.map_or(ptr::null_mut(), NonNull::as_ptr);
        check(unsafe { x_unfetch(self.as_ptr(), offset as ffi::sqlite3_int64, page) })
    }
}

/// Copy `s` into memory owned by SQLite's allocator.
fn sqlite_string(s: &str) -> VfsResult<*mut c_char> {
    let s = CString::new(s).map_err(|_| VfsError::Misuse)?;
    let bytes = s.as_bytes_with_nul();
    unsafe {
        let out = ffi::sqlite3_malloc64(bytes.len() as u64).cast::<u8>();
        if out.is_null() {
            return Err(VfsError::Code(ffi::SQLITE_NOMEM));
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
        Ok(out.cast())
    }
}

/// Take ownership of a string allocated by SQLite, freeing it.
///
/// # Safety
///
/// `s` must be null or come from SQLite's allocator.
unsafe fn take_sqlite_string(s: *mut c_char) -> Option<String> {
    if s.is_null() {
        return None;
    }
    let owned = CStr::from_ptr(s).to_string_lossy().into_owned();
    ffi::sqlite3_free(s.cast());
    Some(owned)
}

/// Copy `bytes` plus a NUL into a C buffer of `cap` bytes, truncating.
unsafe fn copy_c_string(bytes: &[u8], out: *mut c_char, cap: c_int) {
    if out.is_null() || cap <= 0 {
        return;
    }
    let len = bytes.len().min(cap as usize - 1);
    ptr::copy_nonoverlapping(bytes.as_ptr(), out.cast::<u8>(), len);
    *out.add(len) = 0;
}

/// State behind an exported `sqlite3_vfs`, reached through `pAppData`.
struct Exported {
    vfs: SharedVfs,
    name: CString,
}

/// Layout of an exported file: SQLite's header followed by our handle.
#[repr(C)]
struct ExportedFile {
    base: ffi::sqlite3_file,
    file: Option<BoxedFile>,
}

unsafe fn exported<'a>(p_vfs: *mut ffi::sqlite3_vfs) -> &'a Exported {
    &*((*p_vfs).pAppData as *const Exported)
}

unsafe fn exported_file<'a>(p_file: *mut ffi::sqlite3_file) -> Option<&'a mut BoxedFile> {
    (*p_file.cast::<ExportedFile>()).file.as_mut()
}

unsafe fn opt_name<'a>(z_name: *const c_char) -> Option<&'a CStr> {
    (!z_name.is_null()).then(|| CStr::from_ptr(z_name))
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 3,
    xClose: Some(io::close),
    xRead: Some(io::read),
    xWrite: Some(io::write),
    xTruncate: Some(io::truncate),
    xSync: Some(io::sync),
    xFileSize: Some(io::file_size),
    xLock: Some(io::lock),
    xUnlock: Some(io::unlock),
    xCheckReservedLock: Some(io::check_reserved_lock),
    xFileControl: Some(io::file_control),
    xSectorSize: Some(io::sector_size),
    xDeviceCharacteristics: Some(io::device_characteristics),
    xShmMap: Some(io::shm_map),
    xShmLock: Some(io::shm_lock),
    xShmBarrier: Some(io::shm_barrier),
    xShmUnmap: Some(io::shm_unmap),
    xFetch: Some(io::fetch),
    xUnfetch: Some(io::unfetch),
};

/// Held across every lookup-then-register sequence in this module.
static REGISTRATION: Mutex<()> = Mutex::new(());

/// Register `vfs` with SQLite under `vfs.name()`.
///
/// The registration lives for the rest of the process.
pub fn register_vfs(vfs: SharedVfs, make_default: bool) -> VfsResult<()> {
    let _guard = REGISTRATION.lock();
    export_vfs(vfs, make_default)
}

fn export_vfs(vfs: SharedVfs, make_default: bool) -> VfsResult<()> {
    let name = CString::new(vfs.name()).map_err(|_| VfsError::Misuse)?;
    let max_pathname = vfs.max_pathname().min(c_int::MAX as usize) as c_int;
    let state = Box::into_raw(Box::new(Exported { vfs, name }));

    let raw = Box::into_raw(Box::new(ffi::sqlite3_vfs {
        iVersion: 3,
        szOsFile: size_of::<ExportedFile>() as c_int,
        mxPathname: max_pathname,
        pNext: ptr::null_mut(),
        zName: unsafe { (*state).name.as_ptr() },
        pAppData: state.cast(),
        xOpen: Some(vfs::open),
        xDelete: Some(vfs::delete),
        xAccess: Some(vfs::access),
        xFullPathname: Some(vfs::full_pathname),
        xDlOpen: Some(vfs::dl_open),
        xDlError: Some(vfs::dl_error),
        xDlSym: Some(unsafe {
            mem::transmute::<
                unsafe extern "C" fn(
                    *mut ffi::sqlite3_vfs,
                    *mut c_void,
                    *const c_char,
                ) -> Option<DlSymbol>,
                _,
            >(vfs::dl_sym)
        }),
        xDlClose: Some(vfs::dl_close),
        xRandomness: Some(vfs::randomness),
        xSleep: Some(vfs::sleep),
        xCurrentTime: Some(vfs::current_time),
        xGetLastError: Some(vfs::get_last_error),
        xCurrentTimeInt64: Some(vfs::current_time_i64),
        xSetSystemCall: Some(vfs::set_system_call),
        xGetSystemCall: Some(vfs::get_system_call),
        xNextSystemCall: Some(vfs::next_system_call),
    }));

    let rc = unsafe { ffi::sqlite3_vfs_register(raw, make_default as c_int) };
    if rc != ffi::SQLITE_OK {
        unsafe {
            drop(Box::from_raw(raw));
            drop(Box::from_raw(state));
        }
    }
    check(rc)
}

/// Put a [`ShimVfs`] in front of SQLite's current default VFS.
///
/// Fails when SQLite has no default VFS, when a VFS named `options.name`
/// already exists, or with whatever `sqlite3_vfs_register` reports.
/// Concurrent calls are serialized, so of several callers racing on one name
/// exactly one succeeds.
pub fn register_shim(options: &ShimOptions, fail: WriteFailFlag) -> VfsResult<()> {
    let _guard = REGISTRATION.lock();
    let original = NativeVfs::find(None)?.ok_or_else(|| {
        warn!("SQLite has no default VFS to wrap");
        VfsError::Code(code::ERROR)
    })?;
    if NativeVfs::find(Some(&options.name))?.is_some() {
        warn!(name = %options.name, "VFS name already registered with SQLite");
        return Err(VfsError::Misuse);
    }

    let original_name = original.name().to_string();
    let shim = ShimVfs::from_options(options, Arc::new(original), fail);
    export_vfs(Arc::new(shim), options.make_default)?;

    info!(
        shim = %options.name,
        original = %original_name,
        default = options.make_default,
        "Registered SQLite VFS shim"
    );
    Ok(())
}

/// Ask the `main` database of `conn` for its VFS name.
pub fn vfs_name(conn: &rusqlite::Connection) -> Option<String> {
    let mut name: *mut c_char = ptr::null_mut();
    unsafe {
        let rc = ffi::sqlite3_file_control(
            conn.handle(),
            c"main".as_ptr(),
            FCNTL_VFSNAME,
            (&mut name as *mut *mut c_char).cast(),
        );
        let name = take_sqlite_string(name);
        if rc == ffi::SQLITE_OK {
            name
        } else {
            None
        }
    }
}

mod vfs {
    use super::*;

    pub unsafe extern "C" fn open(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        p_file: *mut ffi::sqlite3_file,
        flags: c_int,
        p_out_flags: *mut c_int,
    ) -> c_int {
        let state = exported(p_vfs);
        (*p_file).pMethods = ptr::null();

        match state
            .vfs
            .open(opt_name(z_name), OpenFlags::from_bits_retain(flags))
        {
            Ok((file, out_flags)) => {
                ptr::addr_of_mut!((*p_file.cast::<ExportedFile>()).file).write(Some(file));
                if !p_out_flags.is_null() {
                    *p_out_flags = out_flags.bits();
                }
                (*p_file).pMethods = &IO_METHODS;
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn delete(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        sync_dir: c_int,
    ) -> c_int {
        let Some(name) = opt_name(z_name) else {
            return ffi::SQLITE_MISUSE;
        };
        status(exported(p_vfs).vfs.delete(name, sync_dir != 0))
    }

    pub unsafe extern "C" fn access(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        flags: c_int,
        p_res_out: *mut c_int,
    ) -> c_int {
        let (Some(name), Some(check)) = (opt_name(z_name), AccessCheck::from_raw(flags)) else {
            return ffi::SQLITE_MISUSE;
        };
        match exported(p_vfs).vfs.access(name, check) {
            Ok(ok) => {
                *p_res_out = ok as c_int;
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn full_pathname(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        n_out: c_int,
        z_out: *mut c_char,
    ) -> c_int {
        let Some(name) = opt_name(z_name) else {
            return ffi::SQLITE_MISUSE;
        };
        match exported(p_vfs).vfs.full_pathname(name, n_out.max(0) as usize) {
            Ok(pathname) => {
                let bytes = pathname.path.as_bytes_with_nul();
                if bytes.len() > n_out.max(0) as usize {
                    return ffi::SQLITE_CANTOPEN;
                }
                ptr::copy_nonoverlapping(bytes.as_ptr(), z_out.cast::<u8>(), bytes.len());
                if pathname.via_symlink {
                    code::OK_SYMLINK
                } else {
                    ffi::SQLITE_OK
                }
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn dl_open(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_filename: *const c_char,
    ) -> *mut c_void {
        exported(p_vfs)
            .vfs
            .dl_open(opt_name(z_filename))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    pub unsafe extern "C" fn dl_error(
        p_vfs: *mut ffi::sqlite3_vfs,
        n_byte: c_int,
        z_err_msg: *mut c_char,
    ) {
        let msg = exported(p_vfs).vfs.dl_error(n_byte.max(0) as usize);
        copy_c_string(msg.as_bytes(), z_err_msg, n_byte);
    }

    pub unsafe extern "C" fn dl_sym(
        p_vfs: *mut ffi::sqlite3_vfs,
        handle: *mut c_void,
        z_symbol: *const c_char,
    ) -> Option<DlSymbol> {
        let (Some(handle), Some(symbol)) = (NonNull::new(handle), opt_name(z_symbol)) else {
            return None;
        };
        exported(p_vfs).vfs.dl_sym(handle, symbol)
    }

    pub unsafe extern "C" fn dl_close(p_vfs: *mut ffi::sqlite3_vfs, handle: *mut c_void) {
        if let Some(handle) = NonNull::new(handle) {
            exported(p_vfs).vfs.dl_close(handle);
        }
    }

    pub unsafe extern "C" fn randomness(
        p_vfs: *mut ffi::sqlite3_vfs,
        n_byte: c_int,
        z_out: *mut c_char,
    ) -> c_int {
        if z_out.is_null() || n_byte <= 0 {
            return 0;
        }
        let buf = slice::from_raw_parts_mut(z_out.cast::<u8>(), n_byte as usize);
        exported(p_vfs).vfs.randomness(buf) as c_int
    }

    pub unsafe extern "C" fn sleep(p_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
        let requested = Duration::from_micros(microseconds.max(0) as u64);
        let slept = exported(p_vfs).vfs.sleep(requested);
        slept.as_micros().min(c_int::MAX as u128) as c_int
    }

    pub unsafe extern "C" fn current_time(p_vfs: *mut ffi::sqlite3_vfs, p_time: *mut f64) -> c_int {
        match exported(p_vfs).vfs.current_time() {
            Ok(day) => {
                *p_time = day;
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn get_last_error(
        p_vfs: *mut ffi::sqlite3_vfs,
        n_byte: c_int,
        z_err_msg: *mut c_char,
    ) -> c_int {
        let (rc, msg) = exported(p_vfs).vfs.last_error(n_byte.max(0) as usize);
        copy_c_string(msg.as_bytes(), z_err_msg, n_byte);
        rc
    }

    pub unsafe extern "C" fn current_time_i64(
        p_vfs: *mut ffi::sqlite3_vfs,
        p_time: *mut ffi::sqlite3_int64,
    ) -> c_int {
        match exported(p_vfs).vfs.current_time_i64() {
            Ok(millis) => {
                *p_time = millis;
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn set_system_call(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        p_new: ffi::sqlite3_syscall_ptr,
    ) -> c_int {
        status(exported(p_vfs).vfs.set_system_call(opt_name(z_name), p_new))
    }

    pub unsafe extern "C" fn get_system_call(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
    ) -> ffi::sqlite3_syscall_ptr {
        let name = opt_name(z_name)?;
        exported(p_vfs).vfs.get_system_call(name)
    }

    pub unsafe extern "C" fn next_system_call(
        p_vfs: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
    ) -> *const c_char {
        exported(p_vfs)
            .vfs
            .next_system_call(opt_name(z_name))
            .map_or(ptr::null(), CStr::as_ptr)
    }
}

mod io {
    use super::*;

    pub unsafe extern "C" fn close(p_file: *mut ffi::sqlite3_file) -> c_int {
        let slot = ptr::addr_of_mut!((*p_file.cast::<ExportedFile>()).file);
        let file = slot.read();
        slot.write(None);
        (*p_file).pMethods = ptr::null();
        match file {
            Some(file) => status(file.close()),
            None => ffi::SQLITE_OK,
        }
    }

    pub unsafe extern "C" fn read(
        p_file: *mut ffi::sqlite3_file,
        z_buf: *mut c_void,
        i_amt: c_int,
        i_ofst: ffi::sqlite3_int64,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR_READ;
        };
        let buf = slice::from_raw_parts_mut(z_buf.cast::<u8>(), i_amt.max(0) as usize);
        status(file.read(buf, i_ofst as u64))
    }

    pub unsafe extern "C" fn write(
        p_file: *mut ffi::sqlite3_file,
        z_buf: *const c_void,
        i_amt: c_int,
        i_ofst: ffi::sqlite3_int64,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR_WRITE;
        };
        let buf = slice::from_raw_parts(z_buf.cast::<u8>(), i_amt.max(0) as usize);
        status(file.write(buf, i_ofst as u64))
    }

    pub unsafe extern "C" fn truncate(
        p_file: *mut ffi::sqlite3_file,
        size: ffi::sqlite3_int64,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR_TRUNCATE;
        };
        status(file.truncate(size as u64))
    }

    pub unsafe extern "C" fn sync(p_file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR;
        };
        status(file.sync(flags))
    }

    pub unsafe extern "C" fn file_size(
        p_file: *mut ffi::sqlite3_file,
        p_size: *mut ffi::sqlite3_int64,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR;
        };
        match file.file_size() {
            Ok(size) => {
                *p_size = size as ffi::sqlite3_int64;
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn lock(p_file: *mut ffi::sqlite3_file, e_lock: c_int) -> c_int {
        let (Some(file), Some(level)) = (exported_file(p_file), LockLevel::from_raw(e_lock)) else {
            return ffi::SQLITE_MISUSE;
        };
        status(file.lock(level))
    }

    pub unsafe extern "C" fn unlock(p_file: *mut ffi::sqlite3_file, e_lock: c_int) -> c_int {
        let (Some(file), Some(level)) = (exported_file(p_file), LockLevel::from_raw(e_lock)) else {
            return ffi::SQLITE_MISUSE;
        };
        status(file.unlock(level))
    }

    pub unsafe extern "C" fn check_reserved_lock(
        p_file: *mut ffi::sqlite3_file,
        p_res_out: *mut c_int,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR;
        };
        match file.check_reserved_lock() {
            Ok(reserved) => {
                *p_res_out = reserved as c_int;
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn file_control(
        p_file: *mut ffi::sqlite3_file,
        op: c_int,
        p_arg: *mut c_void,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return ffi::SQLITE_NOTFOUND;
        };
        if op != FCNTL_VFSNAME || p_arg.is_null() {
            return status(file.file_control(FileControl::Raw { op, arg: p_arg }));
        }

        let slot = p_arg.cast::<*mut c_char>();
        let mut reply = take_sqlite_string(*slot);
        *slot = ptr::null_mut();
        let rc = status(file.file_control(FileControl::VfsName(&mut reply)));
        if let Some(reply) = reply {
            match sqlite_string(&reply) {
                Ok(s) => *slot = s,
                Err(err) => return err.code(),
            }
        }
        rc
    }

    pub unsafe extern "C" fn sector_size(p_file: *mut ffi::sqlite3_file) -> c_int {
        exported_file(p_file).map_or(DEFAULT_SECTOR_SIZE, |file| file.sector_size())
    }

    pub unsafe extern "C" fn device_characteristics(p_file: *mut ffi::sqlite3_file) -> c_int {
        exported_file(p_file).map_or(0, |file| file.device_characteristics())
    }

    pub unsafe extern "C" fn shm_map(
        p_file: *mut ffi::sqlite3_file,
        i_pg: c_int,
        pgsz: c_int,
        b_extend: c_int,
        pp: *mut *mut c_void,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR_SHMMAP;
        };
        let mut region = None;
        let rc = status(file.shm_map(i_pg, pgsz, b_extend != 0, &mut region));
        *pp = region.map_or(ptr::null_mut(), NonNull::as_ptr);
        rc
    }

    pub unsafe extern "C" fn shm_lock(
        p_file: *mut ffi::sqlite3_file,
        offset: c_int,
        n: c_int,
        flags: c_int,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return code::IOERR_SHMLOCK;
        };
        status(file.shm_lock(offset, n, flags))
    }

    pub unsafe extern "C" fn shm_barrier(p_file: *mut ffi::sqlite3_file) {
        if let Some(file) = exported_file(p_file) {
            file.shm_barrier();
        }
    }

    pub unsafe extern "C" fn shm_unmap(p_file: *mut ffi::sqlite3_file, delete_flag: c_int) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return ffi::SQLITE_OK;
        };
        status(file.shm_unmap(delete_flag != 0))
    }

    pub unsafe extern "C" fn fetch(
        p_file: *mut ffi::sqlite3_file,
        i_ofst: ffi::sqlite3_int64,
        i_amt: c_int,
        pp: *mut *mut c_void,
    ) -> c_int {
        *pp = ptr::null_mut();
        let Some(file) = exported_file(p_file) else {
            return ffi::SQLITE_OK;
        };
        match file.fetch(i_ofst as u64, i_amt) {
            Ok(page) => {
                *pp = page.map_or(ptr::null_mut(), NonNull::as_ptr);
                ffi::SQLITE_OK
            }
            Err(err) => err.code(),
        }
    }

    pub unsafe extern "C" fn unfetch(
        p_file: *mut ffi::sqlite3_file,
        i_ofst: ffi::sqlite3_int64,
        p_page: *mut c_void,
    ) -> c_int {
        let Some(file) = exported_file(p_file) else {
            return ffi::SQLITE_OK;
        };
        status(file.unfetch(i_ofst as u64, NonNull::new(p_page)))
    }
}
