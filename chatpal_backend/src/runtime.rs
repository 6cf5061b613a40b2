use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{AgentSettings, AgentStores, ChatAgent, RetryPolicy};
use crate::config::{BotConfig, StorageBackend};
use crate::conversation::ConversationStore;
use crate::group_monitor::{GroupMonitor, GroupMonitorSettings};
use crate::llm_client::{CompletionApi, LlmClient, TranscriptionApi};
use crate::memory::MemoryStore;
use crate::persona::{PersonaRegistry, PersonaSelections};
use crate::stats::StatsStore;
use crate::store::{InMemoryStore, JsonDirStore, JsonFileStore, KeyValueStore, SqliteDatabase};
use crate::summarizer::MessageSummarizer;

const PERSONAS_FILE: &str = "user_personas.json";
const STATS_FILE: &str = "user_stats.json";
const MEMORIES_FILE: &str = "user_memories.json";
const SQLITE_FILE: &str = "chatpal.db";

/// Where each store keeps its records.
struct Backends {
    personas: Arc<dyn KeyValueStore>,
    stats: Arc<dyn KeyValueStore>,
    memory: Arc<dyn KeyValueStore>,
    conversations: Arc<dyn KeyValueStore>,
    group_messages: Arc<dyn KeyValueStore>,
}

impl Backends {
    fn json(config: &BotConfig) -> Result<Self> {
        let history_dir = Path::new(&config.history_dir);
        std::fs::create_dir_all(history_dir)
            .with_context(|| format!("Failed to create {:?}", history_dir))?;

        // Aggregate files share the directory with per-user conversations.
        let conversations = JsonDirStore::open(history_dir)?.with_reserved([
            PERSONAS_FILE,
            STATS_FILE,
            MEMORIES_FILE,
        ]);

        Ok(Self {
            personas: Arc::new(JsonFileStore::open(history_dir.join(PERSONAS_FILE))?),
            stats: Arc::new(JsonFileStore::open(history_dir.join(STATS_FILE))?),
            memory: Arc::new(JsonFileStore::open(history_dir.join(MEMORIES_FILE))?),
            conversations: Arc::new(conversations),
            group_messages: Arc::new(JsonDirStore::open(&config.group_messages_dir)?),
        })
    }

    fn sqlite(config: &BotConfig) -> Result<Self> {
        let history_dir = Path::new(&config.history_dir);
        std::fs::create_dir_all(history_dir)
            .with_context(|| format!("Failed to create {:?}", history_dir))?;
        let db = SqliteDatabase::open(history_dir.join(SQLITE_FILE))?;

        Ok(Self {
            personas: Arc::new(db.namespace("personas")),
            stats: Arc::new(db.namespace("stats")),
            memory: Arc::new(db.namespace("memories")),
            conversations: Arc::new(db.namespace("conversations")),
            group_messages: Arc::new(db.namespace("group_messages")),
        })
    }

    fn in_memory() -> Self {
        let fresh = || -> Arc<dyn KeyValueStore> { Arc::new(InMemoryStore::new()) };
        Self {
            personas: fresh(),
            stats: fresh(),
            memory: fresh(),
            conversations: fresh(),
            group_messages: fresh(),
        }
    }
}

pub struct BackendRuntime {
    pub config: BotConfig,
    pub agent: Arc<ChatAgent>,
    pub group_monitor: Arc<GroupMonitor>,
    pub summarizer: Arc<MessageSummarizer>,
}

pub struct BackendRuntimeBuilder {
    config: BotConfig,
    ephemeral: bool,
    completion: Option<Arc<dyn CompletionApi>>,
    transcription: Option<Arc<dyn TranscriptionApi>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BotConfig) -> Self {
        Self {
            config,
            ephemeral: false,
            completion: None,
            transcription: None,
        }
    }

    /// Keep every store in memory; nothing touches the filesystem.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Use a custom completion backend instead of the configured HTTP API.
    pub fn with_completion(mut self, completion: Arc<dyn CompletionApi>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_transcription(mut self, transcription: Arc<dyn TranscriptionApi>) -> Self {
        self.transcription = Some(transcription);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let backends = if self.ephemeral {
            Backends::in_memory()
        } else {
            match config.storage_backend {
                StorageBackend::Json => Backends::json(&config)?,
                StorageBackend::Sqlite => Backends::sqlite(&config)?,
            }
        };

        let registry = Arc::new(PersonaRegistry::new(&config.personas, &config.default_persona));
        let stores = AgentStores {
            personas: Arc::new(PersonaSelections::load(registry, backends.personas)),
            memory: Arc::new(MemoryStore::new(backends.memory)),
            stats: Arc::new(StatsStore::new(backends.stats)),
            conversations: Arc::new(ConversationStore::new(backends.conversations)),
        };
        stores.conversations.load_all();

        let (completion, transcription) = match (self.completion, self.transcription) {
            (Some(completion), transcription) => (completion, transcription),
            (None, transcription) => {
                let llm = Arc::new(LlmClient::from_config(&config)?);
                let transcription =
                    transcription.or_else(|| Some(llm.clone() as Arc<dyn TranscriptionApi>));
                (llm as Arc<dyn CompletionApi>, transcription)
            }
        };

        let mut agent = ChatAgent::new(
            completion,
            stores,
            AgentSettings::from_config(&config),
            RetryPolicy::from_config(&config),
        );
        if let Some(transcription) = transcription {
            agent = agent.with_transcription(transcription);
        }
        let agent = Arc::new(agent);

        let group_monitor = Arc::new(GroupMonitor::new(
            backends.group_messages,
            GroupMonitorSettings::from_config(&config),
        ));
        let summarizer = Arc::new(MessageSummarizer::new(agent.clone()));

        tracing::info!(
            "Backend ready (model: {}, vision: {}, storage: {:?}{})",
            config.llm_model,
            config.vision_model,
            config.storage_backend,
            if self.ephemeral { ", ephemeral" } else { "" }
        );

        Ok(BackendRuntime {
            config,
            agent,
            group_monitor,
            summarizer,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BotConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }

    /// Flush buffered group messages. Call before exiting.
    pub fn shutdown(&self) {
        self.group_monitor.save_all();
        tracing::info!("Saved buffered group messages");
    }
}
