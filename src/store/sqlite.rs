use super::StorageBackend;
use crate::errors::{AppError, AppResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_store (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Durable key/value backend with the same byte-quota semantics as the in-memory one.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    quota_bytes: usize,
}

impl SqliteBackend {
    pub fn new(path: &Path, quota_bytes: usize) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Storage(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
            quota_bytes,
        })
    }

    pub fn in_memory(quota_bytes: usize) -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
            quota_bytes,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

fn used_bytes(conn: &Connection) -> AppResult<usize> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv_store",
        [],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as usize)
}

impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let used = used_bytes(&conn)?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB)) FROM kv_store WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        let projected = used - existing.unwrap_or(0).max(0) as usize + key.len() + value.len();
        if projected > self.quota_bytes {
            return Err(AppError::StorageQuotaExceeded(format!(
                "{} needs {} bytes, quota is {}",
                key, projected, self.quota_bytes
            )));
        }
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }

    fn keys(&self) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key ASC")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn used_bytes(&self) -> AppResult<usize> {
        let conn = self.lock()?;
        used_bytes(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteBackend;
    use crate::store::{PersistentStore, StorageBackend};
    use std::sync::Arc;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("store.sqlite");

        {
            let backend = SqliteBackend::new(&db_path, 1024 * 1024).expect("open");
            let store = PersistentStore::new(Arc::new(backend), "devicehub", 10);
            assert!(store.save("projects", &vec!["alpha"]));
        }

        let backend = SqliteBackend::new(&db_path, 1024 * 1024).expect("reopen");
        let store = PersistentStore::new(Arc::new(backend), "devicehub", 10);
        assert_eq!(store.load::<Vec<String>>("projects"), Some(vec!["alpha".to_string()]));
    }

    #[test]
    fn quota_is_enforced_and_overwrites_are_sized_by_delta() {
        let backend = SqliteBackend::in_memory(40).expect("open");
        backend.set("k", "0123456789").expect("first write fits");
        assert_eq!(backend.used_bytes().expect("used"), 11);
        backend.set("k", &"x".repeat(39)).expect("overwrite fits");
        let err = backend.set("other", "0123456789").expect_err("over quota");
        assert_eq!(err.code(), "STORAGE_QUOTA_EXCEEDED");
        backend.remove("k").expect("remove");
        assert!(backend.keys().expect("keys").is_empty());
    }
}
