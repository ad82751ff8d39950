use anyhow::{Context, Result as AnyhowResult};
use rusqlite::Connection;
use std::path::Path;

/// Open `db` and ask SQLite which VFS stack serves its main file.
pub fn query_vfs_name(db: &Path) -> AnyhowResult<String> {
    #[cfg(feature = "shim")]
    super::install_shim()?;

    let conn = Connection::open(db)
        .with_context(|| format!("Failed to open database '{}'", db.display()))?;
    // The main file is opened lazily; touch the schema so there is one.
    conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
        .context("Failed to read database schema")?;

    vfs_name(&conn).context("VFS did not report a name")
}

pub fn handle_vfs_name_command(stdout: &mut impl std::io::Write, db: &Path) -> AnyhowResult<()> {
    let name = query_vfs_name(db)?;
    writeln!(stdout, "{}", name)?;
    Ok(())
}

#[cfg(feature = "shim")]
pub fn vfs_name(conn: &Connection) -> Option<String> {
    vfsshim::sqlite::vfs_name(conn)
}

#[cfg(not(feature = "shim"))]
pub fn vfs_name(conn: &Connection) -> Option<String> {
    use rusqlite::ffi;
    use std::ffi::{c_char, CStr};

    let mut name: *mut c_char = std::ptr::null_mut();
    unsafe {
        let rc = ffi::sqlite3_file_control(
            conn.handle(),
            c"main".as_ptr(),
            ffi::SQLITE_FCNTL_VFSNAME,
            (&mut name as *mut *mut c_char).cast(),
        );
        if name.is_null() {
            return None;
        }
        let reply = CStr::from_ptr(name).to_string_lossy().into_owned();
        ffi::sqlite3_free(name.cast());
        (rc == ffi::SQLITE_OK).then_some(reply)
    }
}
