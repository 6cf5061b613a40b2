use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::persona::{PersonaDefinition, DEFAULT_PERSONA};

const CONFIG_FILE_NAME: &str = "chatpal_config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Aggregate JSON files plus one JSON file per conversation
    Json,
    /// A single SQLite database next to the history directory
    Sqlite,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Json
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // Telegram transport
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub allowed_chat_id: Option<i64>,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default)]
    pub proxy_url: Option<String>,

    // LLM configuration (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default)]
    pub transcription_language: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    // Retry policy
    #[serde(default = "default_max_api_retry")]
    pub max_api_retry: u32,
    #[serde(default = "default_retry_time_unit_ms")]
    pub retry_time_unit_ms: u64,
    #[serde(default = "default_text_timeout_units")]
    pub text_timeout_units: u32,
    #[serde(default = "default_vision_timeout_units")]
    pub vision_timeout_units: u32,

    // Conversation state
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_persona")]
    pub default_persona: String,
    #[serde(default)]
    pub personas: Vec<PersonaDefinition>,

    // Storage
    #[serde(default)]
    pub storage_backend: StorageBackend,
    #[serde(default = "default_history_dir")]
    pub history_dir: String,
    #[serde(default = "default_group_messages_dir")]
    pub group_messages_dir: String,

    // Group monitor
    #[serde(default = "default_group_cache_size")]
    pub group_cache_size: usize,
    #[serde(default = "default_group_flush_every")]
    pub group_flush_every: usize,
    #[serde(default = "default_group_retention_days")]
    pub group_retention_days: i64,
}

fn default_bot_name() -> String {
    "Chatpal".to_string()
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_max_output_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_api_retry() -> u32 {
    3
}

fn default_retry_time_unit_ms() -> u64 {
    1000
}

fn default_text_timeout_units() -> u32 {
    60
}

fn default_vision_timeout_units() -> u32 {
    90
}

fn default_max_history() -> usize {
    10
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

fn default_history_dir() -> String {
    "chat_history".to_string()
}

fn default_group_messages_dir() -> String {
    "group_messages".to_string()
}

fn default_group_cache_size() -> usize {
    1000
}

fn default_group_flush_every() -> usize {
    50
}

fn default_group_retention_days() -> i64 {
    7
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            allowed_chat_id: None,
            bot_name: default_bot_name(),
            proxy_url: None,
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            llm_model: default_llm_model(),
            vision_model: default_vision_model(),
            transcription_model: default_transcription_model(),
            transcription_language: None,
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            max_api_retry: default_max_api_retry(),
            retry_time_unit_ms: default_retry_time_unit_ms(),
            text_timeout_units: default_text_timeout_units(),
            vision_timeout_units: default_vision_timeout_units(),
            max_history: default_max_history(),
            default_persona: default_persona(),
            personas: Vec::new(),
            storage_backend: StorageBackend::default(),
            history_dir: default_history_dir(),
            group_messages_dir: default_group_messages_dir(),
            group_cache_size: default_group_cache_size(),
            group_flush_every: default_group_flush_every(),
            group_retention_days: default_group_retention_days(),
        }
    }
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Per-user config location, e.g. `~/.config/chatpal/chatpal_config.toml`
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chatpal").join(CONFIG_FILE_NAME))
    }

    /// Load config from chatpal_config.toml (next to executable, then the
    /// user config dir), then apply environment overrides.
    pub fn load() -> Self {
        let candidates = std::iter::once(Self::config_path()).chain(Self::user_config_path());

        for path in candidates {
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            match toml::from_str::<BotConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Defaults with environment variables applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = token.trim().to_string();
        }

        if let Ok(chat_id) = env::var("TELEGRAM_CHAT_ID") {
            if let Ok(id) = chat_id.trim().parse() {
                self.allowed_chat_id = Some(id);
            }
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("MODEL_NAME") {
            self.llm_model = model;
        }

        if let Ok(model) = env::var("VISION_MODEL_NAME") {
            self.vision_model = model;
        }

        if let Ok(model) = env::var("TRANSCRIPTION_MODEL") {
            self.transcription_model = model;
        }

        if let Ok(language) = env::var("TRANSCRIPTION_LANGUAGE") {
            if !language.trim().is_empty() {
                self.transcription_language = Some(language);
            }
        }

        if let Ok(retries) = env::var("MAX_API_RETRY") {
            if let Ok(retries) = retries.parse() {
                self.max_api_retry = retries;
            }
        }

        if let Ok(max_history) = env::var("MAX_HISTORY") {
            if let Ok(max_history) = max_history.parse() {
                self.max_history = max_history;
            }
        }

        if let Ok(dir) = env::var("HISTORY_DIR") {
            if !dir.trim().is_empty() {
                self.history_dir = dir;
            }
        }

        if let Ok(dir) = env::var("GROUP_MESSAGES_DIR") {
            if !dir.trim().is_empty() {
                self.group_messages_dir = dir;
            }
        }

        if let Ok(backend) = env::var("STORAGE_BACKEND") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "json" => self.storage_backend = StorageBackend::Json,
                "sqlite" => self.storage_backend = StorageBackend::Sqlite,
                other => tracing::warn!("Ignoring unknown STORAGE_BACKEND '{}'", other),
            }
        }

        if let Ok(name) = env::var("BOT_NAME") {
            self.bot_name = name;
        }

        if let Ok(proxy) = env::var("PROXY_URL") {
            if !proxy.trim().is_empty() {
                self.proxy_url = Some(proxy);
            }
        }

        if let Ok(persona) = env::var("DEFAULT_PERSONA") {
            if !persona.trim().is_empty() {
                self.default_persona = persona;
            }
        }

        self
    }

    /// Length of one backoff time unit.
    pub fn retry_time_unit(&self) -> Duration {
        Duration::from_millis(self.retry_time_unit_ms)
    }
}
