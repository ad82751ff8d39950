//! In-memory VFS.
//!
//! Files are byte vectors in a map shared by every handle, so a test can open
//! a file through one path (say, a shim) and inspect the bytes directly.

use super::{
    code, iocap, AccessCheck, BoxedFile, FileControl, LockLevel, OpenFlags, Pathname, Vfs,
    VfsError, VfsFile, VfsResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MEMORY_VFS_NAME: &str = "memory";
const MAX_PATHNAME: usize = 512;
const SECTOR_SIZE: i32 = 4096;
/// Largest file a handle will grow to; writes past it report `SQLITE_FULL`.
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Julian day number of the Unix epoch.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

type FileMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// VFS that keeps every file in process memory.
pub struct MemoryVfs {
    files: FileMap,
    next_temp: AtomicU64,
    rng_state: Mutex<u64>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            next_temp: AtomicU64::new(0),
            rng_state: Mutex::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    /// Copy of a file's current contents.
    pub fn snapshot(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }

    /// Names of all files, sorted.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn key(name: &CStr) -> String {
        name.to_string_lossy().into_owned()
    }
}

impl Default for MemoryVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MemoryVfs {
    fn name(&self) -> &str {
        MEMORY_VFS_NAME
    }

    fn max_pathname(&self) -> usize {
        MAX_PATHNAME
    }

    fn open(&self, name: Option<&CStr>, flags: OpenFlags) -> VfsResult<(BoxedFile, OpenFlags)> {
        let key = match name {
            Some(name) => Self::key(name),
            None => format!(
                "temp-{}",
                self.next_temp.fetch_add(1, Ordering::Relaxed)
            ),
        };

        let mut files = self.files.lock();
        let exists = files.contains_key(&key);
        if exists && flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
            return Err(VfsError::CantOpen);
        }
        if !exists {
            if !flags.contains(OpenFlags::CREATE) && name.is_some() {
                return Err(VfsError::CantOpen);
            }
            files.insert(key.clone(), Vec::new());
        }
        drop(files);

        let file = MemoryFile {
            name: key,
            files: self.files.clone(),
            lock: LockLevel::None,
            read_only: flags.contains(OpenFlags::READONLY),
            delete_on_close: flags.contains(OpenFlags::DELETEONCLOSE) || name.is_none(),
        };
        Ok((Box::new(file), flags))
    }

    fn delete(&self, name: &CStr, _sync_dir: bool) -> VfsResult<()> {
        match self.files.lock().remove(&Self::key(name)) {
            Some(_) => Ok(()),
            None => Err(VfsError::Code(code::IOERR_DELETE_NOENT)),
        }
    }

    fn access(&self, name: &CStr, _check: AccessCheck) -> VfsResult<bool> {
        Ok(self.files.lock().contains_key(&Self::key(name)))
    }

    fn full_pathname(&self, name: &CStr, max_len: usize) -> VfsResult<Pathname> {
        if name.to_bytes_with_nul().len() > max_len.min(MAX_PATHNAME) {
            return Err(VfsError::CantOpen);
        }
        Ok(Pathname::new(CString::from(name)))
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        // xorshift64*
        let mut state = self.rng_state.lock();
        for chunk in buf.chunks_mut(8) {
            *state ^= *state >> 12;
            *state ^= *state << 25;
            *state ^= *state >> 27;
            let word = state.wrapping_mul(0x2545_F491_4F6C_DD1D).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        buf.len()
    }

    fn sleep(&self, duration: Duration) -> Duration {
        let start = Instant::now();
        std::thread::sleep(duration);
        start.elapsed()
    }

    fn current_time(&self) -> VfsResult<f64> {
        let millis = unix_millis()?;
        Ok(UNIX_EPOCH_JULIAN_DAY + millis as f64 / MILLIS_PER_DAY)
    }

    fn current_time_i64(&self) -> VfsResult<i64> {
        let millis = unix_millis()?;
        Ok((UNIX_EPOCH_JULIAN_DAY * MILLIS_PER_DAY) as i64 + millis)
    }
}

fn unix_millis() -> VfsResult<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| VfsError::Code(code::ERROR))?;
    Ok(elapsed.as_millis() as i64)
}

/// Handle on a file in a [`MemoryVfs`].
///
/// Locks are tracked per handle only; there is no contention between handles.
struct MemoryFile {
    name: String,
    files: FileMap,
    lock: LockLevel,
    read_only: bool,
    delete_on_close: bool,
}

impl MemoryFile {
    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> VfsResult<T>) -> VfsResult<T> {
        let mut files = self.files.lock();
        let data = files
            .get_mut(&self.name)
            .ok_or(VfsError::Code(code::IOERR_READ))?;
        f(data)
    }
}

impl VfsFile for MemoryFile {
    fn close(self: Box<Self>) -> VfsResult<()> {
        if self.delete_on_close {
            self.files.lock().remove(&self.name);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<()> {
        self.with_data(|data| {
            let start = (offset as usize).min(data.len());
            let available = &data[start..];
            let copied = available.len().min(buf.len());
            buf[..copied].copy_from_slice(&available[..copied]);
            if copied < buf.len() {
                buf[copied..].fill(0);
                return Err(VfsError::Code(code::IOERR_SHORT_READ));
            }
            Ok(())
        })
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::Code(code::READONLY));
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(VfsError::Full)?;
        self.with_data(|data| {
            let (start, end) = (offset as usize, end as usize);
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            Ok(())
        })
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::Code(code::READONLY));
        }
        self.with_data(|data| {
            data.truncate(size as usize);
            Ok(())
        })
    }

    fn sync(&mut self, _flags: i32) -> VfsResult<()> {
        Ok(())
    }

    fn file_size(&mut self) -> VfsResult<u64> {
        self.with_data(|data| Ok(data.len() as u64))
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<()> {
        if level > self.lock {
            self.lock = level;
        }
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        if level < self.lock {
            self.lock = level;
        }
        Ok(())
    }

    fn check_reserved_lock(&mut self) -> VfsResult<bool> {
        Ok(false)
    }

    fn file_control(&mut self, ctl: FileControl<'_>) -> VfsResult<()> {
        match ctl {
            FileControl::VfsName(reply) => {
                *reply = Some(MEMORY_VFS_NAME.to_string());
                Ok(())
            }
            FileControl::Raw { .. } => Err(VfsError::NotFound),
        }
    }

    fn sector_size(&mut self) -> i32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&mut self) -> i32 {
        iocap::ATOMIC | iocap::POWERSAFE_OVERWRITE | iocap::SAFE_APPEND | iocap::SEQUENTIAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW_CREATE: OpenFlags = OpenFlags::READWRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::MAIN_DB);

    #[test]
    fn test_write_then_read() {
        let vfs = MemoryVfs::new();
        let (mut file, flags) = vfs.open(Some(c"/db/main.db"), RW_CREATE).unwrap();
        assert_eq!(flags, RW_CREATE);

        file.write(b"hello", 0).unwrap();
        file.write(b"world", 8).unwrap();

        let mut buf = [0u8; 13];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello\0\0\0world");
        assert_eq!(file.file_size().unwrap(), 13);
        file.close().unwrap();

        assert_eq!(vfs.snapshot("/db/main.db").unwrap(), b"hello\0\0\0world");
    }

    #[test]
    fn test_short_read_zero_fills() {
        let vfs = MemoryVfs::new();
        let (mut file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.write(b"abc", 0).unwrap();

        let mut buf = [0xFFu8; 6];
        let err = file.read(&mut buf, 1).unwrap_err();
        assert_eq!(err.code(), code::IOERR_SHORT_READ);
        assert_eq!(&buf, b"bc\0\0\0\0");
    }

    #[test]
    fn test_open_missing_without_create() {
        let vfs = MemoryVfs::new();
        let err = vfs
            .open(Some(c"missing.db"), OpenFlags::READWRITE)
            .err()
            .unwrap();
        assert!(matches!(err, VfsError::CantOpen));
    }

    #[test]
    fn test_exclusive_create_rejects_existing() {
        let vfs = MemoryVfs::new();
        let (file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.close().unwrap();

        let err = vfs
            .open(Some(c"a.db"), RW_CREATE | OpenFlags::EXCLUSIVE)
            .err()
            .unwrap();
        assert!(matches!(err, VfsError::CantOpen));
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let vfs = MemoryVfs::new();
        let (file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.close().unwrap();

        let (mut file, _) = vfs.open(Some(c"a.db"), OpenFlags::READONLY).unwrap();
        assert_eq!(file.write(b"x", 0).unwrap_err().code(), code::READONLY);
        assert_eq!(file.truncate(0).unwrap_err().code(), code::READONLY);
    }

    #[test]
    fn test_delete_on_close_and_temp_files() {
        let vfs = MemoryVfs::new();
        let (file, _) = vfs
            .open(Some(c"j.db"), RW_CREATE | OpenFlags::DELETEONCLOSE)
            .unwrap();
        assert!(vfs.snapshot("j.db").is_some());
        file.close().unwrap();
        assert!(vfs.snapshot("j.db").is_none());

        let (mut temp, _) = vfs.open(None, OpenFlags::READWRITE).unwrap();
        temp.write(b"scratch", 0).unwrap();
        assert_eq!(vfs.file_names(), vec!["temp-0".to_string()]);
        temp.close().unwrap();
        assert!(vfs.file_names().is_empty());
    }

    #[test]
    fn test_write_past_size_limit_is_full() {
        let vfs = MemoryVfs::new();
        let (mut file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.write(b"keep", 0).unwrap();

        for offset in [u64::MAX, u64::MAX - 1, MAX_FILE_SIZE, MAX_FILE_SIZE - 2] {
            let err = file.write(b"xyz", offset).unwrap_err();
            assert!(matches!(err, VfsError::Full), "offset {offset}");
        }
        assert_eq!(vfs.snapshot("a.db").unwrap(), b"keep");
        assert_eq!(file.file_size().unwrap(), 4);
    }

    #[test]
    fn test_truncate() {
        let vfs = MemoryVfs::new();
        let (mut file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.write(&[1u8; 100], 0).unwrap();
        file.truncate(10).unwrap();
        assert_eq!(file.file_size().unwrap(), 10);
    }

    #[test]
    fn test_delete_and_access() {
        let vfs = MemoryVfs::new();
        let (file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.close().unwrap();

        assert!(vfs.access(c"a.db", AccessCheck::Exists).unwrap());
        vfs.delete(c"a.db", true).unwrap();
        assert!(!vfs.access(c"a.db", AccessCheck::ReadWrite).unwrap());
        assert_eq!(
            vfs.delete(c"a.db", true).unwrap_err().code(),
            code::IOERR_DELETE_NOENT
        );
    }

    #[test]
    fn test_full_pathname_respects_limit() {
        let vfs = MemoryVfs::new();
        let path = vfs.full_pathname(c"/db/a.db", 64).unwrap();
        assert_eq!(path.path.as_c_str(), c"/db/a.db");
        assert!(!path.via_symlink);

        assert!(matches!(
            vfs.full_pathname(c"/db/a.db", 4),
            Err(VfsError::CantOpen)
        ));
    }

    #[test]
    fn test_locks_track_level() {
        let vfs = MemoryVfs::new();
        let (mut file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        file.lock(LockLevel::Shared).unwrap();
        file.lock(LockLevel::Exclusive).unwrap();
        file.unlock(LockLevel::Shared).unwrap();
        assert!(!file.check_reserved_lock().unwrap());
    }

    #[test]
    fn test_randomness_is_deterministic() {
        let a = MemoryVfs::new();
        let b = MemoryVfs::new();
        let mut buf_a = [0u8; 13];
        let mut buf_b = [0u8; 13];

        assert_eq!(a.randomness(&mut buf_a), 13);
        b.randomness(&mut buf_b);
        assert_eq!(buf_a, buf_b);
        assert_ne!(buf_a, [0u8; 13]);
    }

    #[test]
    fn test_clock_agrees_with_itself() {
        let vfs = MemoryVfs::new();
        let day = vfs.current_time().unwrap();
        let millis = vfs.current_time_i64().unwrap();
        assert!(day > UNIX_EPOCH_JULIAN_DAY);
        assert!((millis as f64 / MILLIS_PER_DAY - day).abs() < 1.0);
    }

    #[test]
    fn test_vfs_name_reply() {
        let vfs = MemoryVfs::new();
        let (mut file, _) = vfs.open(Some(c"a.db"), RW_CREATE).unwrap();
        let mut reply = Some("stale".to_string());
        file.file_control(FileControl::VfsName(&mut reply)).unwrap();
        assert_eq!(reply.as_deref(), Some("memory"));
        assert_eq!(file.sector_size(), SECTOR_SIZE);
    }
}
