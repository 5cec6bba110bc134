use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;

use crate::error::{CheckError, CheckResult};
use crate::persistence::{dir_prefix, Persistence};

/// [`Persistence`] backed by a single SQLite table of `path -> blob`.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> CheckResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS artifacts (
         artifact_path TEXT PRIMARY KEY,
         contents BLOB NOT NULL,
         updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
       );",
    )?;
    Ok(())
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> CheckResult<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| CheckError::persistence(&display, err))?;
        }

        let conn = Connection::open(path)
            .map_err(|err| CheckError::persistence(&display, format!("Failed to open SQLite: {err}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> CheckResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Persistence for SqlitePersistence {
    fn read(&self, path: &str) -> CheckResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT contents FROM artifacts WHERE artifact_path = ?1 LIMIT 1;",
            params![path],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| CheckError::persistence(path, err))
    }

    fn write(&self, path: &str, contents: &[u8]) -> CheckResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO artifacts (artifact_path, contents, updated_at)
           VALUES (?1, ?2, strftime('%s','now'))
           ON CONFLICT(artifact_path)
           DO UPDATE SET
             contents = excluded.contents,
             updated_at = excluded.updated_at;",
            params![path, contents],
        )
        .map_err(|err| CheckError::persistence(path, err))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> CheckResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM artifacts WHERE artifact_path = ?1 LIMIT 1;",
                params![path],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CheckError::persistence(path, err))?;
        Ok(found.is_some())
    }

    fn list(&self, dir: &str) -> CheckResult<Vec<String>> {
        let prefix = dir_prefix(dir);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT artifact_path FROM artifacts WHERE substr(artifact_path, 1, ?2) = ?1 ORDER BY artifact_path;")
            .map_err(|err| CheckError::persistence(dir, err))?;
        let rows = stmt
            .query_map(params![prefix, prefix.chars().count() as i64], |row| row.get::<_, String>(0))
            .map_err(|err| CheckError::persistence(dir, err))?;

        let mut paths = Vec::new();
        for row in rows {
            paths.push(row.map_err(|err| CheckError::persistence(dir, err))?);
        }
        Ok(paths)
    }

    fn delete(&self, path: &str) -> CheckResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM artifacts WHERE artifact_path = ?1;", params![path])
            .map_err(|err| CheckError::persistence(path, err))?;
        Ok(())
    }
}
