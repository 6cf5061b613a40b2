use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;

use super::KeyValueStore;

/// Shared SQLite connection holding every namespace in one `kv_entries` table.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Create or open the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS kv_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )"#,
            [],
        )
        .context("Failed to create kv_entries table")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A store view restricted to one namespace.
    pub fn namespace(&self, namespace: &str) -> SqliteStore {
        SqliteStore {
            db: self.clone(),
            namespace: namespace.to_string(),
        }
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }
}

pub struct SqliteStore {
    db: SqliteDatabase,
    namespace: String,
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.db.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).with_context(|| {
                format!("Corrupt value for {}/{}", self.namespace, key)
            })?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let conn = self.db.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_entries (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![self.namespace, key, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.db.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
        )?;
        Ok(removed > 0)
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let conn = self.db.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT key FROM kv_entries WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map([&self.namespace], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
