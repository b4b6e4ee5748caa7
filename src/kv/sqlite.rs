use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{Result, ThrottlerError};
use crate::keys::validate_table_name;
use crate::kv::KvStore;

/// Time a writer waits on another process's file lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Embedded backend: one row per key, text primary key and text value.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    table: String,
}

#[derive(Debug)]
struct ColumnInfo {
    name: String,
    decl_type: String,
    primary_key: bool,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref();
        validate_table_name(table)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = match Self::connect(path) {
            Ok(conn) => conn,
            Err(err) if is_corruption(&err) => Self::recreate(path, &err)?,
            Err(err) => return Err(err.into()),
        };

        Self::provision(&conn, table)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            table: table.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Reading the schema cookie forces the file header to be parsed.
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))?;
        Ok(conn)
    }

    /// Replaces an unreadable file with an empty database.
    fn recreate(path: &Path, cause: &rusqlite::Error) -> Result<Connection> {
        warn!(path = %path.display(), error = %cause, "Store file is unreadable, recreating it");
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self::connect(path)?)
    }

    fn provision(conn: &Connection, table: &str) -> Result<()> {
        let columns = Self::columns(conn, table)?;

        if columns.is_empty() {
            Self::create_table(conn, table)?;
            info!(table, "Created quota table");
            return Ok(());
        }

        let key = match columns.iter().find(|c| c.name.eq_ignore_ascii_case("key")) {
            Some(key) => key,
            None => {
                warn!(table, "Quota table has no key column, recreating it");
                conn.execute_batch(&format!("DROP TABLE \"{}\";", table))?;
                Self::create_table(conn, table)?;
                return Ok(());
            }
        };

        if !has_text_affinity(&key.decl_type) {
            return Err(ThrottlerError::SchemaMismatch {
                table: table.to_string(),
                detail: format!("key column has type '{}', expected TEXT", key.decl_type),
            });
        }

        if !key.primary_key {
            return Err(ThrottlerError::SchemaMismatch {
                table: table.to_string(),
                detail: "key column is not the primary key".to_string(),
            });
        }

        if !columns.iter().any(|c| c.name.eq_ignore_ascii_case("value")) {
            warn!(table, "Quota table has no value column, adding it");
            conn.execute_batch(&format!("ALTER TABLE \"{}\" ADD COLUMN value TEXT;", table))?;
        }

        Ok(())
    }

    fn create_table(conn: &Connection, table: &str) -> rusqlite::Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (key TEXT PRIMARY KEY NOT NULL, value TEXT);",
            table
        ))
    }

    fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
        let rows = stmt.query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                primary_key: row.get::<_, i64>(5)? > 0,
            })
        })?;
        let columns = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    /// Runs `f`, recreating the file and retrying once if it went bad under
    /// the open connection.
    fn with_conn<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| {
            ThrottlerError::Internal("Failed to acquire connection lock".into())
        })?;

        let first = f(&conn);
        match first {
            Err(err) if is_corruption(&err) => {
                // Close the broken handle before the file goes away.
                drop(std::mem::replace(&mut *conn, Connection::open_in_memory()?));
                let fresh = Self::recreate(&self.path, &err)?;
                Self::provision(&fresh, &self.table)?;
                *conn = fresh;
                Ok(f(&conn)?)
            }
            result => Ok(result?),
        }
    }
}

impl KvStore for SqliteStore {
    fn table(&self) -> &str {
        &self.table
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let sql = format!("SELECT value FROM \"{}\" WHERE key = ?1", self.table);
        self.with_conn(|conn| {
            let value = conn
                .query_row(&sql, params![key], |row| {
                    // Non-text values are unreadable data, not errors.
                    Ok(row.get_ref(0)?.as_str().ok().map(str::to_string))
                })
                .optional()?;
            Ok(value.flatten())
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO \"{0}\" (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            self.table
        );
        self.with_conn(|conn| conn.execute(&sql, params![key, value]).map(|_| ()))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let sql = format!("DELETE FROM \"{}\" WHERE key = ?1", self.table);
        self.with_conn(|conn| conn.execute(&sql, params![key]).map(|n| n > 0))
    }

    fn compare_and_set(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool> {
        let changed = match expected {
            // A row whose value is not text reads as absent, so it may be claimed too.
            None => {
                let sql = format!(
                    "INSERT INTO \"{0}\" (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value \
                     WHERE typeof(\"{0}\".value) <> 'text'",
                    self.table
                );
                self.with_conn(|conn| conn.execute(&sql, params![key, value]))?
            }
            Some(expected) => {
                let sql = format!(
                    "UPDATE \"{}\" SET value = ?2 WHERE key = ?1 AND value = ?3",
                    self.table
                );
                self.with_conn(|conn| conn.execute(&sql, params![key, value, expected]))?
            }
        };

        debug!(key, changed, "compare_and_set");
        Ok(changed == 1)
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).map(|_| ()))
    }
}

fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt)
    )
}

/// `SQLite` column affinity rules: an undeclared type stores text unchanged.
fn has_text_affinity(decl_type: &str) -> bool {
    let upper = decl_type.to_ascii_uppercase();
    upper.is_empty() || upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT")
}
