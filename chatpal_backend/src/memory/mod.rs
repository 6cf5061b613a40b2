//! Per-user memory facts: durable `key: value` notes injected into prompts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KeyValueStore;

pub const MEMORY_CONTEXT_HEADER: &str = "Things you remember about the user:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub type UserFacts = BTreeMap<String, MemoryFact>;

/// Write-through memory store. Every mutation persists the user's full fact
/// map before returning; persistence failures are logged, never surfaced.
pub struct MemoryStore {
    backend: Arc<dyn KeyValueStore>,
    facts: Mutex<HashMap<String, UserFacts>>,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            facts: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the user's facts, loading them from the backend first
    /// if this is the first access.
    fn with_user<R>(&self, user_id: &str, f: impl FnOnce(&mut UserFacts) -> R) -> R {
        let mut facts = self.facts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = facts
            .entry(user_id.to_string())
            .or_insert_with(|| self.load_user(user_id));
        f(entry)
    }

    fn load_user(&self, user_id: &str) -> UserFacts {
        match self.backend.get(user_id) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Discarding unreadable memories for {}: {}", user_id, e);
                UserFacts::new()
            }),
            Ok(None) => UserFacts::new(),
            Err(e) => {
                tracing::warn!("Failed to load memories for {}: {}", user_id, e);
                UserFacts::new()
            }
        }
    }

    fn persist(&self, user_id: &str, facts: &UserFacts) {
        let result = serde_json::to_value(facts)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.backend.put(user_id, &value));
        if let Err(e) = result {
            tracing::error!("Failed to persist memories for {}: {}", user_id, e);
        }
    }

    /// Insert or overwrite `key`; both timestamps are reset.
    pub fn add(&self, user_id: &str, key: &str, value: &str) {
        let now = Utc::now();
        self.with_user(user_id, |facts| {
            facts.insert(
                key.to_string(),
                MemoryFact {
                    value: value.to_string(),
                    created_at: now,
                    updated_at: now,
                },
            );
            self.persist(user_id, facts);
        });
        tracing::info!("User {} added memory '{}'", user_id, key);
    }

    /// Change the value of an existing fact, keeping its creation time.
    /// An absent key behaves exactly like [`MemoryStore::add`].
    pub fn update(&self, user_id: &str, key: &str, value: &str) {
        let now = Utc::now();
        self.with_user(user_id, |facts| {
            match facts.get_mut(key) {
                Some(fact) => {
                    fact.value = value.to_string();
                    fact.updated_at = now;
                }
                None => {
                    facts.insert(
                        key.to_string(),
                        MemoryFact {
                            value: value.to_string(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
            self.persist(user_id, facts);
        });
        tracing::info!("User {} updated memory '{}'", user_id, key);
    }

    pub fn get(&self, user_id: &str, key: &str) -> Option<String> {
        self.with_user(user_id, |facts| facts.get(key).map(|f| f.value.clone()))
    }

    pub fn get_fact(&self, user_id: &str, key: &str) -> Option<MemoryFact> {
        self.with_user(user_id, |facts| facts.get(key).cloned())
    }

    pub fn list(&self, user_id: &str) -> UserFacts {
        self.with_user(user_id, |facts| facts.clone())
    }

    pub fn delete(&self, user_id: &str, key: &str) -> bool {
        let removed = self.with_user(user_id, |facts| {
            let removed = facts.remove(key).is_some();
            if removed {
                self.persist(user_id, facts);
            }
            removed
        });
        if removed {
            tracing::info!("User {} deleted memory '{}'", user_id, key);
        }
        removed
    }

    pub fn clear(&self, user_id: &str) {
        self.with_user(user_id, |facts| {
            facts.clear();
            self.persist(user_id, facts);
        });
        tracing::info!("User {} cleared all memories", user_id);
    }

    /// Prompt block listing every fact as `- key: value`, or an empty string
    /// when the user has no facts.
    pub fn render_context(&self, user_id: &str) -> String {
        self.with_user(user_id, |facts| {
            if facts.is_empty() {
                return String::new();
            }
            let lines: Vec<String> = facts
                .iter()
                .map(|(key, fact)| format!("- {}: {}", key, fact.value))
                .collect();
            format!("{}\n{}", MEMORY_CONTEXT_HEADER, lines.join("\n"))
        })
    }
}
