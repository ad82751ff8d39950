use super::fail::WriteFailFlag;
use super::shim::{ShimOptions, ShimVfs};
use super::{code, SharedVfs, VfsError, VfsResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Named VFS implementations with one default.
///
/// Behaves like SQLite's own list: the first entry is the default, a VFS
/// registered without `make_default` goes right after it, and registering
/// the same instance again moves it instead of adding a second entry.
#[derive(Default)]
pub struct VfsRegistry {
    entries: RwLock<Vec<SharedVfs>>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose default is `vfs`.
    pub fn with_default(vfs: SharedVfs) -> Self {
        Self {
            entries: RwLock::new(vec![vfs]),
        }
    }

    /// Register `vfs`, optionally as the new default.
    ///
    /// A different VFS already registered under the same name is an error.
    pub fn register(&self, vfs: SharedVfs, make_default: bool) -> VfsResult<()> {
        let mut entries = self.entries.write();

        if let Some(pos) = entries.iter().position(|e| e.name() == vfs.name()) {
            if !same_instance(&entries[pos], &vfs) {
                warn!(name = vfs.name(), "VFS name already registered");
                return Err(VfsError::Misuse);
            }
            entries.remove(pos);
        }

        if make_default || entries.is_empty() {
            entries.insert(0, vfs);
        } else {
            entries.insert(1, vfs);
        }
        Ok(())
    }

    /// Look up a VFS by name, or the default when `name` is `None`.
    pub fn find(&self, name: Option<&str>) -> Option<SharedVfs> {
        let entries = self.entries.read();
        match name {
            None => entries.first().cloned(),
            Some(name) => entries.iter().find(|e| e.name() == name).cloned(),
        }
    }

    pub fn default_vfs(&self) -> Option<SharedVfs> {
        self.find(None)
    }

    /// Remove a VFS. If it was the default, the next entry takes over.
    pub fn unregister(&self, name: &str) -> Option<SharedVfs> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.name() == name)?;
        Some(entries.remove(pos))
    }

    /// Registered names, default first.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }
}

fn same_instance(a: &SharedVfs, b: &SharedVfs) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Put a shim in front of the registry's current default VFS.
///
/// Fails when there is nothing to wrap, or with whatever `register` reports.
pub fn register_shim(
    registry: &VfsRegistry,
    options: &ShimOptions,
    fail: WriteFailFlag,
) -> VfsResult<Arc<ShimVfs>> {
    let original = registry.default_vfs().ok_or_else(|| {
        warn!("no default VFS to wrap");
        VfsError::Code(code::ERROR)
    })?;
    let original_name = original.name().to_string();

    let shim = Arc::new(ShimVfs::from_options(options, original, fail));
    registry.register(shim.clone(), options.make_default)?;

    info!(
        shim = %options.name,
        original = %original_name,
        "Registered VFS shim"
    );
    Ok(shim)
}
