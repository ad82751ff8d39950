//! The interception shim.
//!
//! [`ShimVfs`] forwards every VFS call to the VFS it wraps. Files it opens
//! are [`ShimFile`]s, which forward everything too, except that writes fail
//! with [`VfsError::Full`] while the shared [`WriteFailFlag`] is set and the
//! VFS-name file control is prefixed with the shim's own name.

use super::fail::WriteFailFlag;
use super::{
    AccessCheck, BoxedFile, DlHandle, DlSymbol, FileControl, LockLevel, MappedPage, OpenFlags,
    Pathname, SharedVfs, ShmRegion, SyscallPtr, Vfs, VfsError, VfsFile, VfsResult,
};
use serde::Deserialize;
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Name the shim registers under unless told otherwise.
pub const SHIM_NAME: &str = "vfsshim";

/// Display name used for anonymous temporary files.
const TEMP_DISPLAY_NAME: &str = "(temp)";

/// Options for registering a shim
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShimOptions {
    /// Registered VFS name, also used as the prefix in VFS-name replies.
    pub name: String,
    /// Register as the default VFS so connections pick it up implicitly.
    pub make_default: bool,
}

impl Default for ShimOptions {
    fn default() -> Self {
        Self {
            name: SHIM_NAME.to_string(),
            make_default: true,
        }
    }
}

impl ShimOptions {
    /// Options for a default shim registered under `name`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Options for a shim that is only used when asked for by name
    pub fn non_default(mut self) -> Self {
        self.make_default = false;
        self
    }
}

/// Short name for log lines: everything after the last `/`.
pub fn display_name(name: Option<&CStr>) -> String {
    let Some(name) = name else {
        return TEMP_DISPLAY_NAME.to_string();
    };
    let bytes = name.to_bytes();
    let start = bytes
        .iter()
        .rposition(|&b| b == b'/')
        .map_or(0, |slash| slash + 1);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// VFS that forwards to `original`, instrumenting the files it opens.
pub struct ShimVfs {
    name: Arc<str>,
    original: SharedVfs,
    fail: WriteFailFlag,
}

impl ShimVfs {
    pub fn new(original: SharedVfs, fail: WriteFailFlag) -> Self {
        Self::with_name(SHIM_NAME, original, fail)
    }

    pub fn with_name(name: &str, original: SharedVfs, fail: WriteFailFlag) -> Self {
        Self {
            name: Arc::from(name),
            original,
            fail,
        }
    }

    pub fn from_options(options: &ShimOptions, original: SharedVfs, fail: WriteFailFlag) -> Self {
        Self::with_name(&options.name, original, fail)
    }

    /// The wrapped VFS.
    pub fn original(&self) -> &SharedVfs {
        &self.original
    }

    pub fn fail_flag(&self) -> &WriteFailFlag {
        &self.fail
    }
}

impl Vfs for ShimVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_pathname(&self) -> usize {
        self.original.max_pathname()
    }

    fn open(&self, name: Option<&CStr>, flags: OpenFlags) -> VfsResult<(BoxedFile, OpenFlags)> {
        let shown = display_name(name);
        info!(file = %shown, "SQLite: Opening {}", shown);

        let (original, out_flags) = self.original.open(name, flags)?;
        let file = ShimFile {
            vfs_name: self.name.clone(),
            original,
            name: shown,
            fail: self.fail.clone(),
        };
        Ok((Box::new(file), out_flags))
    }

    fn delete(&self, name: &CStr, sync_dir: bool) -> VfsResult<()> {
        self.original.delete(name, sync_dir)
    }

    fn access(&self, name: &CStr, check: AccessCheck) -> VfsResult<bool> {
        self.original.access(name, check)
    }

    fn full_pathname(&self, name: &CStr, max_len: usize) -> VfsResult<Pathname> {
        self.original.full_pathname(name, max_len)
    }

    fn dl_open(&self, filename: Option<&CStr>) -> Option<DlHandle> {
        self.original.dl_open(filename)
    }

    fn dl_error(&self, max_len: usize) -> String {
        self.original.dl_error(max_len)
    }

    fn dl_sym(&self, handle: DlHandle, symbol: &CStr) -> Option<DlSymbol> {
        self.original.dl_sym(handle, symbol)
    }

    fn dl_close(&self, handle: DlHandle) {
        self.original.dl_close(handle)
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        self.original.randomness(buf)
    }

    fn sleep(&self, duration: Duration) -> Duration {
        self.original.sleep(duration)
    }

    fn current_time(&self) -> VfsResult<f64> {
        self.original.current_time()
    }

    fn current_time_i64(&self) -> VfsResult<i64> {
        self.original.current_time_i64()
    }

    fn last_error(&self, max_len: usize) -> (i32, String) {
        self.original.last_error(max_len)
    }

    fn set_system_call(&self, name: Option<&CStr>, ptr: Option<SyscallPtr>) -> VfsResult<()> {
        self.original.set_system_call(name, ptr)
    }

    fn get_system_call(&self, name: &CStr) -> Option<SyscallPtr> {
        self.original.get_system_call(name)
    }

    fn next_system_call(&self, name: Option<&CStr>) -> Option<&'static CStr> {
        self.original.next_system_call(name)
    }
}

/// File opened through a [`ShimVfs`].
pub struct ShimFile {
    vfs_name: Arc<str>,
    original: BoxedFile,
    name: String,
    fail: WriteFailFlag,
}

impl ShimFile {
    /// Display name derived from the opened path.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VfsFile for ShimFile {
    fn close(self: Box<Self>) -> VfsResult<()> {
        let ShimFile { original, name, .. } = *self;
        let result = original.close();
        info!(file = %name, "SQLite: Closing {}", name);
        result
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<()> {
        self.original.read(buf, offset)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> VfsResult<()> {
        if self.fail.is_set() {
            info!(
                file = %self.name,
                bytes = buf.len(),
                "SQLite: FAILED write of {}b to {}",
                buf.len(),
                self.name
            );
            return Err(VfsError::Full);
        }

        self.original.write(buf, offset)?;
        info!(
            file = %self.name,
            bytes = buf.len(),
            "SQLite: Write {}b to {}",
            buf.len(),
            self.name
        );
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.original.truncate(size)
    }

    fn sync(&mut self, flags: i32) -> VfsResult<()> {
        self.original.sync(flags)
    }

    fn file_size(&mut self) -> VfsResult<u64> {
        self.original.file_size()
    }

    fn lock(&mut self, level: LockLevel) -> VfsResult<()> {
        self.original.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> VfsResult<()> {
        self.original.unlock(level)
    }

    fn check_reserved_lock(&mut self) -> VfsResult<bool> {
        self.original.check_reserved_lock()
    }

    fn file_control(&mut self, ctl: FileControl<'_>) -> VfsResult<()> {
        match ctl {
            FileControl::VfsName(reply) => {
                self.original.file_control(FileControl::VfsName(&mut *reply))?;
                let inner = reply.take().unwrap_or_default();
                *reply = Some(format!("{}/{}", self.vfs_name, inner));
                Ok(())
            }
            raw => self.original.file_control(raw),
        }
    }

    fn sector_size(&mut self) -> i32 {
        self.original.sector_size()
    }

    fn device_characteristics(&mut self) -> i32 {
        self.original.device_characteristics()
    }

    fn shm_map(
        &mut self,
        region: i32,
        size: i32,
        extend: bool,
        out: &mut Option<ShmRegion>,
    ) -> VfsResult<()> {
        self.original.shm_map(region, size, extend, out)
    }

    fn shm_lock(&mut self, offset: i32, count: i32, flags: i32) -> VfsResult<()> {
        self.original.shm_lock(offset, count, flags)
    }

    fn shm_barrier(&mut self) {
        self.original.shm_barrier()
    }

    fn shm_unmap(&mut self, delete: bool) -> VfsResult<()> {
        self.original.shm_unmap(delete)
    }

    fn fetch(&mut self, offset: u64, amount: i32) -> VfsResult<Option<MappedPage>> {
        self.original.fetch(offset, amount)
    }

    fn unfetch(&mut self, offset: u64, page: Option<MappedPage>) -> VfsResult<()> {
        self.original.unfetch(offset, page)
    }
}


/// Property tests for display-name derivation.
#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::CString;

    proptest! {
        #[test]
        fn prop_display_name_is_last_segment(
            dirs in prop::collection::vec("[a-z0-9._-]{0,8}", 0..4),
            file in "[a-zA-Z0-9._-]{1,16}",
        ) {
            let mut path = dirs.join("/");
            if !dirs.is_empty() {
                path.push('/');
            }
            path.push_str(&file);
            let c_path = CString::new(path).unwrap();

            let name = display_name(Some(&c_path));
            prop_assert!(!name.contains('/'));
            prop_assert_eq!(name, file);
        }
    }
}
