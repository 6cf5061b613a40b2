//! Persona registry and per-user persona selection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::KeyValueStore;

/// A selectable system-prompt profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaDefinition {
    pub key: String,
    pub name: String,
    pub description: String,
    pub prompt: String,
}

impl PersonaDefinition {
    fn builtin(key: &str, name: &str, description: &str, prompt: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            prompt: prompt.to_string(),
        }
    }
}

pub const DEFAULT_PERSONA: &str = "assistant";

const SPLIT_HINT: &str = "When a reply reads better as several short chat messages, \
     separate them with |||.";

fn builtin_personas() -> Vec<PersonaDefinition> {
    vec![
        PersonaDefinition::builtin(
            "assistant",
            "Assistant",
            "Helpful, clear and to the point",
            "You are a helpful assistant. Answer accurately and concisely, \
             ask a short clarifying question when a request is ambiguous.",
        ),
        PersonaDefinition::builtin(
            "classmate",
            "Classmate",
            "A laid-back classmate who chats like a friend",
            &format!(
                "You are the user's classmate. Talk casually like a friend over chat, \
                 keep messages short and relaxed. {}",
                SPLIT_HINT
            ),
        ),
        PersonaDefinition::builtin(
            "confidante",
            "Confidante",
            "Warm, attentive and a good listener",
            &format!(
                "You are a warm and caring friend. Listen first, reflect what the user \
                 feels, and offer gentle encouragement. {}",
                SPLIT_HINT
            ),
        ),
        PersonaDefinition::builtin(
            "joker",
            "Joker",
            "Playful, witty, never too serious",
            &format!(
                "You are a witty joker. Keep things light with puns and playful teasing, \
                 but still answer what was asked. {}",
                SPLIT_HINT
            ),
        ),
        PersonaDefinition::builtin(
            "scholar",
            "Scholar",
            "A patient tutor who explains step by step",
            "You are a top student and patient tutor. Explain concepts step by step, \
             use small examples, and check understanding at the end.",
        ),
    ]
}

/// Immutable mapping of persona key to definition, fixed at startup.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: BTreeMap<String, PersonaDefinition>,
    default_persona: PersonaDefinition,
}

impl PersonaRegistry {
    /// Built-in personas, with `overrides` replacing or extending them by key.
    ///
    /// Falls back to [`DEFAULT_PERSONA`] when `default_key` is not registered.
    pub fn new(overrides: &[PersonaDefinition], default_key: &str) -> Self {
        let mut personas: BTreeMap<String, PersonaDefinition> = builtin_personas()
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        for persona in overrides {
            personas.insert(persona.key.clone(), persona.clone());
        }

        let default_persona = match personas.get(default_key) {
            Some(persona) => persona.clone(),
            None => {
                tracing::warn!(
                    "Default persona '{}' is not registered, using '{}'",
                    default_key,
                    DEFAULT_PERSONA
                );
                personas
                    .entry(DEFAULT_PERSONA.to_string())
                    .or_insert_with(|| builtin_personas().swap_remove(0))
                    .clone()
            }
        };

        Self {
            personas,
            default_persona,
        }
    }

    /// The definition for `key`, or the default persona when unknown.
    pub fn resolve(&self, key: &str) -> &PersonaDefinition {
        self.personas.get(key).unwrap_or(&self.default_persona)
    }

    pub fn is_valid(&self, key: &str) -> bool {
        self.personas.contains_key(key)
    }

    pub fn default_key(&self) -> &str {
        &self.default_persona.key
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::new(&[], DEFAULT_PERSONA)
    }
}

/// Which persona each user has picked. Write-through to the backing store.
pub struct PersonaSelections {
    registry: Arc<PersonaRegistry>,
    backend: Arc<dyn KeyValueStore>,
    selections: Mutex<BTreeMap<String, String>>,
}

impl PersonaSelections {
    pub fn load(registry: Arc<PersonaRegistry>, backend: Arc<dyn KeyValueStore>) -> Self {
        let mut selections = BTreeMap::new();
        match backend.list_keys() {
            Ok(keys) => {
                for user_id in keys {
                    match backend.get(&user_id) {
                        Ok(Some(Value::String(key))) => {
                            selections.insert(user_id, key);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Failed to load persona for {}: {}", user_id, e),
                    }
                }
                if !selections.is_empty() {
                    tracing::info!("Loaded persona selections for {} user(s)", selections.len());
                }
            }
            Err(e) => tracing::warn!("Failed to list persona selections: {}", e),
        }

        Self {
            registry,
            backend,
            selections: Mutex::new(selections),
        }
    }

    /// The user's persona key; unset or no-longer-registered keys map to the default.
    pub fn get(&self, user_id: &str) -> String {
        let selections = self.selections.lock().unwrap_or_else(|e| e.into_inner());
        match selections.get(user_id) {
            Some(key) if self.registry.is_valid(key) => key.clone(),
            _ => self.registry.default_key().to_string(),
        }
    }

    pub fn set(&self, user_id: &str, persona_key: &str) -> Result<()> {
        if !self.registry.is_valid(persona_key) {
            bail!("Unknown persona '{}'", persona_key);
        }

        self.selections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_string(), persona_key.to_string());

        if let Err(e) = self
            .backend
            .put(user_id, &Value::String(persona_key.to_string()))
        {
            tracing::error!("Failed to persist persona for {}: {}", user_id, e);
        }
        tracing::info!("User {} switched persona to '{}'", user_id, persona_key);
        Ok(())
    }

    pub fn registry(&self) -> &PersonaRegistry {
        &self.registry
    }
}
