//! Runs in its own process: registering the shim as default changes the
//! engine's global VFS list.
#![cfg(all(feature = "sqlite", unix))]

use rusqlite::{Connection, ErrorCode};
use tempfile::TempDir;
use vfsshim::sqlite::{register_shim, vfs_name};
use vfsshim::{ShimOptions, VfsError, WriteFailFlag, SHIM_NAME};

#[test]
fn test_default_shim_intercepts_plain_connections() {
    let flag = WriteFailFlag::new();
    register_shim(&ShimOptions::default(), flag.clone()).unwrap();

    let again = register_shim(&ShimOptions::default(), WriteFailFlag::new()).unwrap_err();
    assert!(matches!(again, VfsError::Misuse));

    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path().join("default.db")).unwrap();
    conn.execute_batch("CREATE TABLE t (v)").unwrap();
    assert_eq!(vfs_name(&conn), Some(format!("{SHIM_NAME}/unix")));

    flag.set();
    let err = conn.execute("INSERT INTO t VALUES (1)", []).unwrap_err();
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::DiskFull));

    flag.clear();
    conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
}
