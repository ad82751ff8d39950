use anyhow::{bail, Context, Result as AnyhowResult};
use clap::ValueEnum;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;

/// Size of one record written by the memory backend.
const RECORD_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SQLite on its default VFS
    Sqlite,
    /// The in-memory VFS, driven directly without SQLite
    Memory,
}

#[derive(Debug, Serialize)]
pub struct FailedBatch {
    /// Status the failing write reported.
    pub status: i32,
    pub message: String,
    /// A write after clearing the flag went through.
    pub recovered: bool,
}

#[derive(Debug, Serialize)]
pub struct ExerciseReport {
    pub backend: Backend,
    pub vfs_name: Option<String>,
    pub rows_written: usize,
    pub failed_batch: Option<FailedBatch>,
    pub rows_in_db: u64,
}

impl ExerciseReport {
    fn new(backend: Backend, vfs_name: Option<String>) -> Self {
        Self {
            backend,
            vfs_name,
            rows_written: 0,
            failed_batch: None,
            rows_in_db: 0,
        }
    }

    pub fn write_text(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        let backend = match self.backend {
            Backend::Sqlite => "sqlite",
            Backend::Memory => "memory",
        };
        writeln!(out, "backend:      {}", backend)?;
        writeln!(
            out,
            "vfs:          {}",
            self.vfs_name.as_deref().unwrap_or("(unknown)")
        )?;
        writeln!(out, "rows written: {}", self.rows_written)?;
        if let Some(failed) = &self.failed_batch {
            writeln!(
                out,
                "failed batch: status {} ({}){}",
                failed.status,
                failed.message,
                if failed.recovered { ", recovered" } else { "" }
            )?;
        }
        writeln!(out, "rows in db:   {}", self.rows_in_db)
    }
}

pub fn handle_exercise_command(
    stdout: &mut impl std::io::Write,
    db: &Path,
    rows: usize,
    fail: bool,
    json: bool,
    backend: Backend,
) -> AnyhowResult<()> {
    let report = run_exercise(db, rows, fail, backend)?;
    if json {
        writeln!(stdout, "{}", serde_json::to_string(&report)?)?;
    } else {
        report.write_text(stdout)?;
    }
    Ok(())
}

pub fn run_exercise(
    db: &Path,
    rows: usize,
    fail: bool,
    backend: Backend,
) -> AnyhowResult<ExerciseReport> {
    match backend {
        Backend::Sqlite => exercise_sqlite(db, rows, fail),
        Backend::Memory => exercise_memory(db, rows, fail),
    }
}

fn payload(seq: usize) -> Vec<u8> {
    let mut record = format!("row {:08}", seq).into_bytes();
    record.resize(RECORD_SIZE, b'.');
    record
}

fn insert_batch(conn: &mut Connection, start: usize, count: usize) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached("INSERT INTO exercise (seq, payload) VALUES (?1, ?2)")?;
        for seq in start..start + count {
            stmt.execute(params![seq as i64, payload(seq)])?;
        }
    }
    tx.commit()
}

#[cfg(feature = "shim")]
fn sqlite_status(err: &rusqlite::Error) -> i32 {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
        _ => rusqlite::ffi::SQLITE_ERROR,
    }
}

fn exercise_sqlite(db: &Path, rows: usize, fail: bool) -> AnyhowResult<ExerciseReport> {
    #[cfg(feature = "shim")]
    let flag = super::install_shim()?;
    #[cfg(not(feature = "shim"))]
    if fail {
        bail!("--fail needs a build with the `shim` feature");
    }

    let mut conn = Connection::open(db)
        .with_context(|| format!("Failed to open database '{}'", db.display()))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS exercise (
            seq INTEGER NOT NULL,
            payload BLOB NOT NULL
        )",
    )
    .context("Failed to create table")?;

    let mut report = ExerciseReport::new(Backend::Sqlite, super::vfs_name::vfs_name(&conn));

    insert_batch(&mut conn, 0, rows).context("Failed to insert rows")?;
    report.rows_written = rows;

    #[cfg(feature = "shim")]
    if fail {
        flag.set();
        let result = insert_batch(&mut conn, rows, rows.max(1));
        flag.clear();

        let err = match result {
            Ok(()) => bail!("Insert succeeded while writes were set to fail"),
            Err(err) => err,
        };
        insert_batch(&mut conn, rows, 1).context("Insert failed after clearing the fail flag")?;
        report.rows_written += 1;
        report.failed_batch = Some(FailedBatch {
            status: sqlite_status(&err),
            message: err.to_string(),
            recovered: true,
        });
    }

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM exercise", [], |row| row.get(0))
        .context("Failed to count rows")?;
    report.rows_in_db = count as u64;
    Ok(report)
}

#[cfg(feature = "shim")]
fn exercise_memory(db: &Path, rows: usize, fail: bool) -> AnyhowResult<ExerciseReport> {
    use std::ffi::CString;
    use std::sync::Arc;
    use vfsshim::{
        register_shim, FileControl, MemoryVfs, OpenFlags, ShimOptions, VfsFile, VfsRegistry,
        VfsResult, WriteFailFlag,
    };

    fn write_records(file: &mut dyn VfsFile, start: usize, count: usize) -> VfsResult<()> {
        for seq in start..start + count {
            file.write(&payload(seq), (seq * RECORD_SIZE) as u64)?;
        }
        Ok(())
    }

    let flag = WriteFailFlag::new();
    let registry = VfsRegistry::with_default(Arc::new(MemoryVfs::new()));
    register_shim(&registry, &ShimOptions::default(), flag.clone())?;
    let vfs = registry.default_vfs().context("No default VFS registered")?;

    let path = CString::new(db.to_string_lossy().into_owned())
        .context("Database path contains a NUL byte")?;
    let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB;
    let (mut file, _) = vfs.open(Some(&path), flags)?;

    let mut vfs_name = None;
    file.file_control(FileControl::VfsName(&mut vfs_name))?;
    let mut report = ExerciseReport::new(Backend::Memory, vfs_name);

    write_records(file.as_mut(), 0, rows)?;
    report.rows_written = rows;

    if fail {
        flag.set();
        let result = write_records(file.as_mut(), rows, rows.max(1));
        flag.clear();

        let err = match result {
            Ok(()) => bail!("Write succeeded while writes were set to fail"),
            Err(err) => err,
        };
        write_records(file.as_mut(), rows, 1)
            .context("Write failed after clearing the fail flag")?;
        report.rows_written += 1;
        report.failed_batch = Some(FailedBatch {
            status: err.code(),
            message: err.to_string(),
            recovered: true,
        });
    }

    report.rows_in_db = file.file_size()? / RECORD_SIZE as u64;
    file.close()?;
    Ok(report)
}

#[cfg(not(feature = "shim"))]
fn exercise_memory(_db: &Path, _rows: usize, _fail: bool) -> AnyhowResult<ExerciseReport> {
    bail!("The memory backend needs a build with the `shim` feature")
}

#[cfg(all(test, feature = "shim"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL: i32 = 13;

    #[test]
    fn test_memory_exercise_without_failure() {
        let report = run_exercise(Path::new("/mem/a.db"), 5, false, Backend::Memory).unwrap();
        assert_eq!(report.vfs_name.as_deref(), Some("vfsshim/memory"));
        assert_eq!(report.rows_written, 5);
        assert_eq!(report.rows_in_db, 5);
        assert!(report.failed_batch.is_none());
    }

    #[test]
    fn test_memory_exercise_with_failure() {
        let report = run_exercise(Path::new("/mem/b.db"), 3, true, Backend::Memory).unwrap();
        let failed = report.failed_batch.unwrap();
        assert_eq!(failed.status, FULL);
        assert!(failed.recovered);
        assert_eq!(report.rows_written, 4);
        assert_eq!(report.rows_in_db, 4);
    }

    #[test]
    fn test_memory_failure_with_zero_rows() {
        let report = run_exercise(Path::new("/mem/c.db"), 0, true, Backend::Memory).unwrap();
        assert_eq!(report.failed_batch.unwrap().status, FULL);
        assert_eq!(report.rows_in_db, 1);
    }

    #[test]
    fn test_json_report() {
        let mut out = Vec::new();
        handle_exercise_command(
            &mut out,
            Path::new("/mem/d.db"),
            2,
            true,
            true,
            Backend::Memory,
        )
        .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["vfs_name"], "vfsshim/memory");
        assert_eq!(json["failed_batch"]["status"], FULL);
        assert_eq!(json["rows_in_db"], 3);
    }

    #[test]
    fn test_text_report() {
        let mut out = Vec::new();
        handle_exercise_command(
            &mut out,
            Path::new("/mem/e.db"),
            1,
            false,
            false,
            Backend::Memory,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("backend:      memory"));
        assert!(text.contains("vfs:          vfsshim/memory"));
        assert!(text.contains("rows in db:   1"));
        assert!(!text.contains("failed batch"));
    }

    // The SQLite scenario shares one process-wide flag, so it runs as a
    // single test.
    #[cfg(unix)]
    #[test]
    fn test_sqlite_exercise_through_default_shim() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("exercise.db");

        let first = run_exercise(&db, 4, false, Backend::Sqlite).unwrap();
        assert_eq!(first.vfs_name.as_deref(), Some("vfsshim/unix"));
        assert_eq!(first.rows_in_db, 4);

        let second = run_exercise(&db, 4, true, Backend::Sqlite).unwrap();
        let failed = second.failed_batch.unwrap();
        assert_eq!(failed.status & 0xff, FULL);
        assert!(failed.recovered);
        assert_eq!(second.rows_in_db, 9);

        let name = crate::cmd::vfs_name::query_vfs_name(&db).unwrap();
        assert_eq!(name, "vfsshim/unix");
    }
}

#[cfg(all(test, not(feature = "shim")))]
mod plain_tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_plain_build_runs_on_native_vfs() {
        let dir = TempDir::new().unwrap();
        let report = run_exercise(&dir.path().join("plain.db"), 3, false, Backend::Sqlite).unwrap();
        assert_eq!(report.vfs_name.as_deref(), Some("unix"));
        assert_eq!(report.rows_in_db, 3);
        assert!(report.failed_batch.is_none());
    }

    #[test]
    fn test_plain_build_refuses_failure_injection() {
        let dir = TempDir::new().unwrap();
        let err = run_exercise(&dir.path().join("plain.db"), 3, true, Backend::Sqlite).unwrap_err();
        assert!(err.to_string().contains("shim"), "{err}");
        assert!(!dir.path().join("plain.db").exists());
    }

    #[test]
    fn test_plain_build_has_no_memory_backend() {
        let err = run_exercise(Path::new("/mem/a.db"), 1, false, Backend::Memory).unwrap_err();
        assert!(err.to_string().contains("shim"), "{err}");
    }
}
