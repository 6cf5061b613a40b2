//! Durable key-value storage behind every per-user store.
//!
//! The stores in this crate (conversations, memory facts, stats, persona
//! selections, group message logs) only ever talk to a [`KeyValueStore`].
//! Which medium backs it is decided once, at bootstrap:
//!
//! - [`JsonFileStore`]: one aggregate JSON object file, rewritten on each write
//! - [`JsonDirStore`]: one JSON file per key inside a directory
//! - [`SqliteStore`]: a namespaced table in a shared SQLite database
//! - [`InMemoryStore`]: nothing durable, used by tests and ephemeral sessions

pub mod json;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use serde_json::Value;

pub use json::{JsonDirStore, JsonFileStore};
pub use sqlite::{SqliteDatabase, SqliteStore};

/// Minimal durable key-value contract.
///
/// Implementations must be safe to share between tasks; callers hold their
/// own in-memory mirrors and treat a failed write as non-fatal.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    /// Returns `true` when the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
    fn list_keys(&self) -> Result<Vec<String>>;
}

/// Replace every character that is not alphanumeric, `-` or `_` with `_`.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("In-memory store lock poisoned: {}", e))
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock_entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.lock_entries()?.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock_entries()?.remove(key).is_some())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.lock_entries()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_key_replaces_unsafe_characters() {
        assert_eq!(sanitize_key("12345"), "12345");
        assert_eq!(sanitize_key("user-1_a"), "user-1_a");
        assert_eq!(sanitize_key("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_key("a b@c.d"), "a_b_c_d");
    }

    #[test]
    fn in_memory_store_put_get_delete() {
        let store = InMemoryStore::new();
        assert!(store.get("alice").unwrap().is_none());

        store.put("alice", &json!({"n": 1})).unwrap();
        store.put("bob", &json!([1, 2])).unwrap();
        assert_eq!(store.get("alice").unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.list_keys().unwrap(), vec!["alice", "bob"]);

        assert!(store.delete("alice").unwrap());
        assert!(!store.delete("alice").unwrap());
        assert_eq!(store.list_keys().unwrap(), vec!["bob"]);
    }
}
