#![cfg(all(feature = "sqlite", unix))]

use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use vfsshim::sqlite::{self, register_shim};
use vfsshim::{ShimOptions, VfsError, WriteFailFlag};

/// Register a non-default shim under a name unique to this process.
fn shim(prefix: &str) -> (String, WriteFailFlag) {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let name = format!("{prefix}-{}", NEXT.fetch_add(1, Ordering::Relaxed));
    let flag = WriteFailFlag::new();
    register_shim(&ShimOptions::named(name.as_str()).non_default(), flag.clone()).unwrap();
    (name, flag)
}

fn open(dir: &TempDir, vfs: &str) -> Connection {
    Connection::open_with_flags_and_vfs(dir.path().join("test.db"), OpenFlags::default(), vfs)
        .unwrap()
}

fn count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_writes_pass_through_until_flag_is_set() {
    let dir = TempDir::new().unwrap();
    let (name, flag) = shim("passthrough");
    let conn = open(&dir, &name);

    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    conn.execute("INSERT INTO t (v) VALUES (?1)", ["one"]).unwrap();
    assert_eq!(count(&conn), 1);

    flag.set();
    let err = conn
        .execute("INSERT INTO t (v) VALUES (?1)", ["two"])
        .unwrap_err();
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::DiskFull));
    assert_eq!(count(&conn), 1);

    flag.clear();
    conn.execute("INSERT INTO t (v) VALUES (?1)", ["three"]).unwrap();
    assert_eq!(count(&conn), 2);
}

#[test]
fn test_reads_succeed_while_writes_fail() {
    let dir = TempDir::new().unwrap();
    let (name, flag) = shim("reads");
    let conn = open(&dir, &name);

    conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('a'), ('b');")
        .unwrap();
    flag.set();

    let values: Vec<String> = conn
        .prepare("SELECT v FROM t ORDER BY v")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(values, vec!["a", "b"]);
}

#[test]
fn test_vfs_name_reports_shim_over_original() {
    let dir = TempDir::new().unwrap();
    let (name, _flag) = shim("named");
    let conn = open(&dir, &name);
    conn.execute_batch("CREATE TABLE t (v)").unwrap();

    assert_eq!(sqlite::vfs_name(&conn), Some(format!("{name}/unix")));
}

#[test]
fn test_plain_connection_reports_native_name() {
    let dir = TempDir::new().unwrap();
    let conn = Connection::open(dir.path().join("plain.db")).unwrap();
    conn.execute_batch("CREATE TABLE t (v)").unwrap();

    assert_eq!(sqlite::vfs_name(&conn).as_deref(), Some("unix"));
}

#[test]
fn test_data_written_through_shim_is_readable_without_it() {
    let dir = TempDir::new().unwrap();
    let (name, _flag) = shim("durable");
    {
        let conn = open(&dir, &name);
        conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('kept');")
            .unwrap();
    }

    let plain = Connection::open(dir.path().join("test.db")).unwrap();
    let v: String = plain.query_row("SELECT v FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(v, "kept");
}

#[test]
fn test_flags_are_per_shim() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let (a, flag_a) = shim("iso");
    let (b, _flag_b) = shim("iso");
    let conn_a = open(&dir_a, &a);
    let conn_b = open(&dir_b, &b);
    conn_a.execute_batch("CREATE TABLE t (v)").unwrap();
    conn_b.execute_batch("CREATE TABLE t (v)").unwrap();

    flag_a.set();
    assert!(conn_a.execute("INSERT INTO t VALUES (1)", []).is_err());
    conn_b.execute("INSERT INTO t VALUES (1)", []).unwrap();
    assert_eq!(count(&conn_b), 1);
}

#[test]
fn test_wal_mode_works_through_shim() {
    let dir = TempDir::new().unwrap();
    let (name, flag) = shim("wal");
    let conn = open(&dir, &name);

    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
    conn.execute_batch("CREATE TABLE t (v); INSERT INTO t VALUES (1);")
        .unwrap();

    flag.set();
    let err = conn.execute("INSERT INTO t VALUES (2)", []).unwrap_err();
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::DiskFull));
    flag.clear();

    conn.execute("INSERT INTO t VALUES (3)", []).unwrap();
    assert_eq!(count(&conn), 2);
}

#[test]
fn test_duplicate_shim_name_is_rejected() {
    let (name, _flag) = shim("dup");
    let err = register_shim(&ShimOptions::named(name.as_str()).non_default(), WriteFailFlag::new())
        .unwrap_err();
    assert!(matches!(err, VfsError::Misuse));
}

#[test]
fn test_concurrent_registration_under_one_name_admits_one() {
    let name = "racing-shim";
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    register_shim(&ShimOptions::named(name).non_default(), WriteFailFlag::new())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|err| matches!(err, VfsError::Misuse)));
}
