//! JSON-file backed stores.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::{sanitize_key, KeyValueStore};

/// Write through a sibling temp file and rename, so a crash mid-write never
/// leaves a truncated JSON document behind.
fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, body).with_context(|| format!("Failed to write {:?}", tmp_path))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// All keys live in a single JSON object file that is rewritten wholesale on
/// every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the aggregate file. A missing or unreadable
    /// file starts the store empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let entries = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(map) => {
                    tracing::info!("Loaded {} entries from {:?}", map.len(), path);
                    map
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {:?}, starting empty: {}", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                tracing::warn!("Failed to read {:?}, starting empty: {}", path, e);
                Map::new()
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, Map<String, Value>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("JSON store lock poisoned: {}", e))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock_entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let mut entries = self.lock_entries()?;
        entries.insert(key.to_string(), value.clone());
        write_json_atomic(&self.path, &Value::Object(entries.clone()))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock_entries()?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        write_json_atomic(&self.path, &Value::Object(entries.clone()))?;
        Ok(true)
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.lock_entries()?.keys().cloned().collect())
    }
}

/// One `<sanitized key>.json` file per key.
///
/// `list_keys` reports file stems, i.e. sanitized keys. Files named in the
/// reserved set (aggregate stores sharing the directory) are skipped.
pub struct JsonDirStore {
    dir: PathBuf,
    reserved: HashSet<String>,
}

impl JsonDirStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        Ok(Self {
            dir,
            reserved: HashSet::new(),
        })
    }

    pub fn with_reserved<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.extend(names.into_iter().map(Into::into));
        self
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

impl KeyValueStore for JsonDirStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.file_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(value))
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        write_json_atomic(&self.file_for(key), value)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.file_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {:?}", path)),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("Failed to list {:?}", self.dir))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.reserved.contains(file_name) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
