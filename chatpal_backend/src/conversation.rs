//! Per-user conversation history, mirrored in memory and persisted per user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::llm_client::{Message, MessageContent, Role};
use crate::store::KeyValueStore;

/// One role-tagged message unit of a stored conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: MessageContent,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

impl From<ConversationTurn> for Message {
    fn from(turn: ConversationTurn) -> Self {
        Message {
            role: turn.role,
            content: turn.content,
        }
    }
}

pub struct ConversationStore {
    backend: Arc<dyn KeyValueStore>,
    conversations: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Warm the cache with every persisted conversation. Returns how many
    /// were loaded. Keys come back in the backend's (sanitized) form.
    pub fn load_all(&self) -> usize {
        let keys = match self.backend.list_keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Failed to list stored conversations: {}", e);
                return 0;
            }
        };

        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let mut loaded = 0;
        for key in keys {
            if conversations.contains_key(&key) {
                continue;
            }
            conversations.insert(key.clone(), self.load_user(&key));
            loaded += 1;
        }
        if loaded > 0 {
            tracing::info!("Loaded conversation history for {} user(s)", loaded);
        }
        loaded
    }

    fn load_user(&self, user_id: &str) -> Vec<ConversationTurn> {
        match self.backend.get(user_id) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Discarding unreadable history for {}: {}", user_id, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to load history for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    fn with_user<R>(&self, user_id: &str, f: impl FnOnce(&mut Vec<ConversationTurn>) -> R) -> R {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let history = conversations
            .entry(user_id.to_string())
            .or_insert_with(|| self.load_user(user_id));
        f(history)
    }

    /// The user's history, oldest first. Empty when nothing was persisted.
    pub fn get(&self, user_id: &str) -> Vec<ConversationTurn> {
        self.with_user(user_id, |history| history.clone())
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.with_user(user_id, |history| history.len())
    }

    pub fn append(&self, user_id: &str, turns: impl IntoIterator<Item = ConversationTurn>) {
        self.with_user(user_id, |history| history.extend(turns));
    }

    /// Keep only the most recent `max_turns` turns.
    pub fn truncate(&self, user_id: &str, max_turns: usize) {
        self.with_user(user_id, |history| {
            if history.len() > max_turns {
                let excess = history.len() - max_turns;
                history.drain(..excess);
            }
        });
    }

    /// Reset to empty and persist immediately.
    pub fn clear(&self, user_id: &str) {
        self.with_user(user_id, |history| history.clear());
        self.persist(user_id);
        tracing::info!("Cleared conversation history for {}", user_id);
    }

    pub fn persist(&self, user_id: &str) {
        let history = self.get(user_id);
        let result = serde_json::to_value(&history)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.backend.put(user_id, &value));
        if let Err(e) = result {
            tracing::error!("Failed to persist history for {}: {}", user_id, e);
        }
    }
}
