pub mod exercise;
pub mod vfs_name;

/// Install the shim in front of SQLite's default VFS, once per process.
///
/// Every caller gets a clone of the same flag.
#[cfg(feature = "shim")]
pub fn install_shim() -> anyhow::Result<vfsshim::WriteFailFlag> {
    use parking_lot::Mutex;
    use vfsshim::{sqlite, ShimOptions, WriteFailFlag};

    static FLAG: Mutex<Option<WriteFailFlag>> = Mutex::new(None);

    let mut slot = FLAG.lock();
    if let Some(flag) = slot.as_ref() {
        return Ok(flag.clone());
    }
    let flag = WriteFailFlag::new();
    sqlite::register_shim(&ShimOptions::default(), flag.clone())
        .map_err(|e| anyhow::anyhow!("Failed to register VFS shim: {}", e))?;
    *slot = Some(flag.clone());
    Ok(flag)
}
