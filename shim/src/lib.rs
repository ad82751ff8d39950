//! A diagnostic shim for SQLite's VFS layer.
//!
//! [`ShimVfs`] sits on top of another VFS, forwards every call to it, and
//! fails writes with `SQLITE_FULL` while its [`WriteFailFlag`] is set. The
//! `sqlite` feature bridges the traits to the real engine so the shim can be
//! registered in front of SQLite's default VFS.

pub mod vfs;

pub use vfs::{
    fail::WriteFailFlag,
    memory::MemoryVfs,
    registry::{register_shim, VfsRegistry},
    shim::{display_name, ShimFile, ShimOptions, ShimVfs, SHIM_NAME},
    AccessCheck, BoxedFile, FileControl, LockLevel, OpenFlags, Pathname, SharedVfs, Vfs, VfsError,
    VfsFile, VfsResult,
};

#[cfg(feature = "sqlite")]
pub use vfs::sqlite;
