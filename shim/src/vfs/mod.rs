pub mod fail;
pub mod memory;
pub mod registry;
pub mod shim;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use bitflags::bitflags;
use std::ffi::{c_void, CStr, CString};
use std::ptr::NonNull;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

/// SQLite result codes that cross the VFS boundary.
pub mod code {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const BUSY: i32 = 5;
    pub const READONLY: i32 = 8;
    pub const IOERR: i32 = 10;
    pub const NOTFOUND: i32 = 12;
    pub const FULL: i32 = 13;
    pub const CANTOPEN: i32 = 14;
    pub const MISUSE: i32 = 21;

    pub const IOERR_READ: i32 = IOERR | (1 << 8);
    pub const IOERR_SHORT_READ: i32 = IOERR | (2 << 8);
    pub const IOERR_WRITE: i32 = IOERR | (3 << 8);
    pub const IOERR_TRUNCATE: i32 = IOERR | (6 << 8);
    pub const IOERR_DELETE: i32 = IOERR | (10 << 8);
    pub const IOERR_SHMLOCK: i32 = IOERR | (20 << 8);
    pub const IOERR_SHMMAP: i32 = IOERR | (21 << 8);
    pub const IOERR_DELETE_NOENT: i32 = IOERR | (23 << 8);

    /// Success from `xFullPathname` when a symlink was resolved.
    pub const OK_SYMLINK: i32 = OK | (2 << 8);
}

/// Device characteristic bits reported by `xDeviceCharacteristics`.
pub mod iocap {
    pub const ATOMIC: i32 = 0x0000_0001;
    pub const SAFE_APPEND: i32 = 0x0000_0200;
    pub const SEQUENTIAL: i32 = 0x0000_0400;
    pub const POWERSAFE_OVERWRITE: i32 = 0x0000_1000;
}

/// `SQLITE_FCNTL_VFSNAME`
pub const FCNTL_VFSNAME: i32 = 12;

/// Default sector size, matching `SQLITE_DEFAULT_SECTOR_SIZE`.
pub const DEFAULT_SECTOR_SIZE: i32 = 4096;

/// VFS error type
///
/// Each variant corresponds to exactly one SQLite result code, so a status
/// coming out of a wrapped VFS survives a trip through this type unchanged.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("database or disk is full")]
    Full,
    #[error("unable to open database file")]
    CantOpen,
    #[error("unknown operation")]
    NotFound,
    #[error("bad parameter or other API misuse")]
    Misuse,
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite status {0}")]
    Code(i32),
}

impl VfsError {
    /// The SQLite result code reported to the engine for this error.
    pub fn code(&self) -> i32 {
        match self {
            VfsError::Full => code::FULL,
            VfsError::CantOpen => code::CANTOPEN,
            VfsError::NotFound => code::NOTFOUND,
            VfsError::Misuse => code::MISUSE,
            VfsError::Io(_) => code::IOERR,
            VfsError::Code(rc) => *rc,
        }
    }

    /// Wrap a non-OK status returned by the engine or a native VFS.
    pub fn from_code(rc: i32) -> Self {
        match rc {
            code::FULL => VfsError::Full,
            code::CANTOPEN => VfsError::CantOpen,
            code::NOTFOUND => VfsError::NotFound,
            code::MISUSE => VfsError::Misuse,
            other => VfsError::Code(other),
        }
    }
}

pub type VfsResult<T> = StdResult<T, VfsError>;

/// Turn an engine status into a `VfsResult`.
pub fn check(rc: i32) -> VfsResult<()> {
    if rc == code::OK {
        Ok(())
    } else {
        Err(VfsError::from_code(rc))
    }
}

/// Status code for a unit result.
pub fn status(result: VfsResult<()>) -> i32 {
    match result {
        Ok(()) => code::OK,
        Err(err) => err.code(),
    }
}

bitflags! {
    /// `SQLITE_OPEN_*` flags passed to and returned from `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        const READONLY = 0x0000_0001;
        const READWRITE = 0x0000_0002;
        const CREATE = 0x0000_0004;
        const DELETEONCLOSE = 0x0000_0008;
        const EXCLUSIVE = 0x0000_0010;
        const AUTOPROXY = 0x0000_0020;
        const URI = 0x0000_0040;
        const MEMORY = 0x0000_0080;
        const MAIN_DB = 0x0000_0100;
        const TEMP_DB = 0x0000_0200;
        const TRANSIENT_DB = 0x0000_0400;
        const MAIN_JOURNAL = 0x0000_0800;
        const TEMP_JOURNAL = 0x0000_1000;
        const SUBJOURNAL = 0x0000_2000;
        const SUPER_JOURNAL = 0x0000_4000;
        const NOMUTEX = 0x0000_8000;
        const FULLMUTEX = 0x0001_0000;
        const SHAREDCACHE = 0x0002_0000;
        const PRIVATECACHE = 0x0004_0000;
        const WAL = 0x0008_0000;
        const NOFOLLOW = 0x0100_0000;
        const EXRESCODE = 0x0200_0000;
    }
}

/// The question asked by `access`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Exists,
    ReadWrite,
    Read,
}

impl AccessCheck {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(AccessCheck::Exists),
            1 => Some(AccessCheck::ReadWrite),
            2 => Some(AccessCheck::Read),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            AccessCheck::Exists => 0,
            AccessCheck::ReadWrite => 1,
            AccessCheck::Read => 2,
        }
    }
}

/// File lock levels, in increasing order of exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(LockLevel::None),
            1 => Some(LockLevel::Shared),
            2 => Some(LockLevel::Reserved),
            3 => Some(LockLevel::Pending),
            4 => Some(LockLevel::Exclusive),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// A file-control request.
///
/// Only the VFS-name query is decoded; every other opcode travels as the
/// engine's opaque argument pointer.
#[derive(Debug)]
pub enum FileControl<'a> {
    /// `SQLITE_FCNTL_VFSNAME`. Any value already present is consumed by the
    /// VFS that answers.
    VfsName(&'a mut Option<String>),
    Raw { op: i32, arg: *mut c_void },
}

impl FileControl<'_> {
    pub fn op(&self) -> i32 {
        match self {
            FileControl::VfsName(_) => FCNTL_VFSNAME,
            FileControl::Raw { op, .. } => *op,
        }
    }
}

/// Result of `full_pathname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pathname {
    pub path: CString,
    /// The path went through a symbolic link (`SQLITE_OK_SYMLINK`).
    pub via_symlink: bool,
}

impl Pathname {
    pub fn new(path: CString) -> Self {
        Self {
            path,
            via_symlink: false,
        }
    }
}

/// Handle returned by `dl_open`, only ever handed back to the VFS that made it.
pub type DlHandle = NonNull<c_void>;
/// Symbol resolved by `dl_sym`.
pub type DlSymbol = unsafe extern "C" fn();
/// System call override slot.
pub type SyscallPtr = unsafe extern "C" fn();
/// Mapped shared-memory region.
pub type ShmRegion = NonNull<c_void>;
/// Page returned by a memory-mapped `fetch`.
pub type MappedPage = NonNull<c_void>;

/// An open file handle.
///
/// Mirrors `sqlite3_io_methods`. `close` consumes the handle, so a file is
/// closed at most once.
pub trait VfsFile: Send {
    fn close(self: Box<Self>) -> VfsResult<()>;

    /// Fill `buf` from `offset`. A short read zero-fills the tail and
    /// reports `SQLITE_IOERR_SHORT_READ`.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<()>;

    fn write(&mut self, buf: &[u8], offset: u64) -> VfsResult<()>;

    fn truncate(&mut self, size: u64) -> VfsResult<()>;

    fn sync(&mut self, flags: i32) -> VfsResult<()>;

    fn file_size(&mut self) -> VfsResult<u64>;

    fn lock(&mut self, level: LockLevel) -> VfsResult<()>;

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()>;

    /// Whether any connection holds a RESERVED or stronger lock.
    fn check_reserved_lock(&mut self) -> VfsResult<bool>;

    fn file_control(&mut self, _ctl: FileControl<'_>) -> VfsResult<()> {
        Err(VfsError::NotFound)
    }

    fn sector_size(&mut self) -> i32 {
        DEFAULT_SECTOR_SIZE
    }

    fn device_characteristics(&mut self) -> i32 {
        0
    }

    /// Map shared-memory region `region` of `size` bytes into `out`.
    ///
    /// The region is written even when the status is not OK, since
    /// `SQLITE_READONLY` still comes with a usable mapping.
    fn shm_map(
        &mut self,
        _region: i32,
        _size: i32,
        _extend: bool,
        _out: &mut Option<ShmRegion>,
    ) -> VfsResult<()> {
        Err(VfsError::Code(code::IOERR_SHMMAP))
    }

    fn shm_lock(&mut self, _offset: i32, _count: i32, _flags: i32) -> VfsResult<()> {
        Err(VfsError::Code(code::IOERR_SHMLOCK))
    }

    fn shm_barrier(&mut self) {}

    fn shm_unmap(&mut self, _delete: bool) -> VfsResult<()> {
        Ok(())
    }

    /// `Ok(None)` tells the engine to fall back to `read`.
    fn fetch(&mut self, _offset: u64, _amount: i32) -> VfsResult<Option<MappedPage>> {
        Ok(None)
    }

    fn unfetch(&mut self, _offset: u64, _page: Option<MappedPage>) -> VfsResult<()> {
        Ok(())
    }
}

/// A boxed file handle for dynamic dispatch
pub type BoxedFile = Box<dyn VfsFile>;

/// Virtual file system trait.
///
/// Mirrors `sqlite3_vfs`. Names are passed as the engine's own C strings so
/// that URI parameters stored after the terminating NUL stay reachable by a
/// wrapped native VFS.
pub trait Vfs: Send + Sync {
    /// Name the VFS is registered under.
    fn name(&self) -> &str;

    fn max_pathname(&self) -> usize {
        1024
    }

    /// Open a file. `None` asks for an anonymous temporary file.
    ///
    /// Returns the handle together with the flags actually granted.
    fn open(&self, name: Option<&CStr>, flags: OpenFlags) -> VfsResult<(BoxedFile, OpenFlags)>;

    fn delete(&self, name: &CStr, sync_dir: bool) -> VfsResult<()>;

    fn access(&self, name: &CStr, check: AccessCheck) -> VfsResult<bool>;

    /// Canonical form of `name`, at most `max_len` bytes including the NUL.
    fn full_pathname(&self, name: &CStr, max_len: usize) -> VfsResult<Pathname>;

    fn dl_open(&self, _filename: Option<&CStr>) -> Option<DlHandle> {
        None
    }

    fn dl_error(&self, _max_len: usize) -> String {
        "Loadable extensions are not supported".to_string()
    }

    fn dl_sym(&self, _handle: DlHandle, _symbol: &CStr) -> Option<DlSymbol> {
        None
    }

    fn dl_close(&self, _handle: DlHandle) {}

    /// Fill `buf` with random bytes, returning how many were produced.
    fn randomness(&self, buf: &mut [u8]) -> usize;

    /// Sleep for `duration`, returning the time actually slept.
    fn sleep(&self, duration: Duration) -> Duration;

    /// Current time as a Julian day number.
    fn current_time(&self) -> VfsResult<f64>;

    /// Current time as milliseconds since the Julian epoch.
    fn current_time_i64(&self) -> VfsResult<i64> {
        self.current_time().map(|day| (day * 86_400_000.0) as i64)
    }

    /// Most recent OS error code and message.
    fn last_error(&self, _max_len: usize) -> (i32, String) {
        (0, String::new())
    }

    fn set_system_call(&self, _name: Option<&CStr>, _ptr: Option<SyscallPtr>) -> VfsResult<()> {
        Err(VfsError::NotFound)
    }

    fn get_system_call(&self, _name: &CStr) -> Option<SyscallPtr> {
        None
    }

    fn next_system_call(&self, _name: Option<&CStr>) -> Option<&'static CStr> {
        None
    }
}

/// A shared VFS trait object for dynamic dispatch
pub type SharedVfs = Arc<dyn Vfs>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(VfsError::Full.code(), 13);
        assert_eq!(VfsError::CantOpen.code(), 14);
        assert_eq!(VfsError::NotFound.code(), 12);
        assert_eq!(VfsError::Misuse.code(), 21);
        assert_eq!(VfsError::from(std::io::Error::other("boom")).code(), 10);
        assert_eq!(VfsError::Code(code::IOERR_SHORT_READ).code(), 522);
    }

    #[test]
    fn test_from_code_decodes_known_statuses() {
        assert!(matches!(VfsError::from_code(13), VfsError::Full));
        assert!(matches!(VfsError::from_code(14), VfsError::CantOpen));
        assert!(matches!(VfsError::from_code(5), VfsError::Code(5)));
    }

    #[test]
    fn test_check() {
        assert!(check(code::OK).is_ok());
        assert_eq!(check(code::BUSY).unwrap_err().code(), code::BUSY);
        assert_eq!(status(Ok(())), code::OK);
        assert_eq!(status(Err(VfsError::Full)), code::FULL);
    }

    #[test]
    fn test_open_flags_keep_unknown_bits() {
        let raw = 0x0000_0106 | 0x4000_0000;
        let flags = OpenFlags::from_bits_retain(raw);
        assert!(flags.contains(OpenFlags::MAIN_DB | OpenFlags::CREATE));
        assert_eq!(flags.bits(), raw);
    }

    #[test]
    fn test_lock_levels_are_ordered() {
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
        for raw in 0..5 {
            assert_eq!(LockLevel::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(LockLevel::from_raw(5), None);
    }

    #[test]
    fn test_access_check_raw() {
        for raw in 0..3 {
            assert_eq!(AccessCheck::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(AccessCheck::from_raw(3), None);
    }

    #[test]
    fn test_file_control_op() {
        let mut name = None;
        assert_eq!(FileControl::VfsName(&mut name).op(), FCNTL_VFSNAME);
        let raw = FileControl::Raw {
            op: 5,
            arg: std::ptr::null_mut(),
        };
        assert_eq!(raw.op(), 5);
    }
}
