//! Conversation orchestration: persona + memory prompt assembly, bounded
//! retries against the completion API, and write-through of history and
//! usage stats.

pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use base64::Engine;
use tokio::sync::OwnedMutexGuard;

use crate::config::BotConfig;
use crate::conversation::{ConversationStore, ConversationTurn};
use crate::llm_client::{
    CompletionApi, CompletionError, CompletionRequest, Message, TranscriptionApi,
};
use crate::memory::MemoryStore;
use crate::persona::PersonaSelections;
use crate::stats::StatsStore;

pub use retry::{degraded_reply, FailureClass, Modality, RetryPolicy};

/// A single inbound message from a user.
#[derive(Debug, Clone)]
pub enum ChatInput {
    Text(String),
    Image { caption: String, image: Vec<u8> },
}

impl ChatInput {
    pub fn modality(&self) -> Modality {
        match self {
            ChatInput::Text(_) => Modality::Text,
            ChatInput::Image { .. } => Modality::Vision,
        }
    }

    /// What gets stored in history. Image bytes never leave the request.
    fn history_turn(&self) -> ConversationTurn {
        match self {
            ChatInput::Text(text) => ConversationTurn::user(text.clone()),
            ChatInput::Image { caption, .. } => {
                ConversationTurn::user(format!("[sent an image] {}", caption))
            }
        }
    }

    fn request_message(&self) -> Message {
        match self {
            ChatInput::Text(text) => Message::user(text.clone()),
            ChatInput::Image { caption, image } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(image);
                Message::user_with_image(caption, &encoded)
            }
        }
    }
}

/// The per-user state the agent reads and writes.
#[derive(Clone)]
pub struct AgentStores {
    pub personas: Arc<PersonaSelections>,
    pub memory: Arc<MemoryStore>,
    pub stats: Arc<StatsStore>,
    pub conversations: Arc<ConversationStore>,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub text_model: String,
    pub vision_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Exchanges kept per user; stored turns are capped at twice this.
    pub max_history: usize,
}

impl AgentSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            text_model: config.llm_model.clone(),
            vision_model: config.vision_model.clone(),
            max_tokens: config.max_output_tokens,
            temperature: config.temperature,
            max_history: config.max_history,
        }
    }

    fn model_for(&self, modality: Modality) -> &str {
        match modality {
            Modality::Text => &self.text_model,
            Modality::Vision => &self.vision_model,
        }
    }
}

/// One async mutex per user id, so two messages from the same user never
/// interleave their read-modify-write of history and stats. An entry lives
/// only while someone holds or waits on it.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn acquire(&self, user_id: &str) -> UserLockGuard<'_> {
        let lock = self
            .lock_map()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        UserLockGuard {
            guard: Some(lock.lock_owned().await),
            user_id: user_id.to_string(),
            locks: self,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock_map().len()
    }
}

struct UserLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    user_id: String,
    locks: &'a UserLocks,
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the map lock, so a count of one means
        // the map holds the last reference.
        let mut locks = self.locks.lock_map();
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

pub struct ChatAgent {
    completion: Arc<dyn CompletionApi>,
    transcription: Option<Arc<dyn TranscriptionApi>>,
    stores: AgentStores,
    settings: AgentSettings,
    retry: RetryPolicy,
    user_locks: UserLocks,
}

impl ChatAgent {
    pub fn new(
        completion: Arc<dyn CompletionApi>,
        stores: AgentStores,
        settings: AgentSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            completion,
            transcription: None,
            stores,
            settings,
            retry,
            user_locks: UserLocks::default(),
        }
    }

    pub fn with_transcription(mut self, transcription: Arc<dyn TranscriptionApi>) -> Self {
        self.transcription = Some(transcription);
        self
    }

    pub fn stores(&self) -> &AgentStores {
        &self.stores
    }

    /// Produce a reply for `input`. Always returns text: failures turn into a
    /// degraded reply chosen by failure class, and leave history untouched.
    pub async fn converse(&self, user_id: &str, input: ChatInput) -> String {
        let _guard = self.user_locks.acquire(user_id).await;
        let modality = input.modality();

        let history = self.stores.conversations.get(user_id);
        if history.is_empty() {
            self.stores.stats.record_conversation(user_id);
        }

        let persona_key = self.stores.personas.get(user_id);
        let system_prompt = self.system_prompt(user_id, &persona_key);

        // Attempts count even when no reply comes back.
        self.stores.stats.record_message(user_id, &persona_key);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system_prompt));
        messages.extend(history.into_iter().map(Message::from));
        messages.push(input.request_message());

        let request = CompletionRequest {
            model: self.settings.model_for(modality).to_string(),
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            timeout: self.retry.timeout_for(modality),
        };

        match self.complete_with_retry(request, modality).await {
            Ok(reply) => {
                let reply = reply.trim().to_string();
                let conversations = &self.stores.conversations;
                conversations.append(
                    user_id,
                    [input.history_turn(), ConversationTurn::assistant(reply.clone())],
                );
                conversations.truncate(user_id, self.settings.max_history * 2);
                conversations.persist(user_id);
                reply
            }
            Err(class) => {
                tracing::error!(
                    "Giving up on {:?} completion for {} ({:?})",
                    modality,
                    user_id,
                    class
                );
                degraded_reply(modality, class).to_string()
            }
        }
    }

    /// Transcribe a voice note and answer it through the text path.
    pub async fn converse_voice(&self, user_id: &str, audio: Vec<u8>) -> String {
        let Some(transcription) = &self.transcription else {
            tracing::warn!("Voice message from {} but no transcription backend", user_id);
            return retry::VOICE_FAILURE_REPLY.to_string();
        };

        let transcript = match transcription.transcribe(audio).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Transcription failed for {}: {:#}", user_id, e);
                return retry::VOICE_FAILURE_REPLY.to_string();
            }
        };

        let transcript = transcript.trim();
        if transcript.is_empty() {
            return retry::VOICE_EMPTY_REPLY.to_string();
        }
        tracing::debug!("Transcribed voice from {}: {}", user_id, transcript);
        self.converse(user_id, ChatInput::Text(transcript.to_string()))
            .await
    }

    /// A single stateless text completion under the same retry policy. No
    /// per-user store is read or written.
    pub async fn complete_once(&self, system_prompt: &str, prompt: &str) -> String {
        let request = CompletionRequest {
            model: self.settings.text_model.clone(),
            messages: vec![Message::system(system_prompt), Message::user(prompt)],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            timeout: self.retry.timeout_for(Modality::Text),
        };
        match self.complete_with_retry(request, Modality::Text).await {
            Ok(reply) => reply.trim().to_string(),
            Err(class) => degraded_reply(Modality::Text, class).to_string(),
        }
    }

    /// Select a new persona. A persona change starts a fresh conversation.
    pub async fn switch_persona(&self, user_id: &str, persona_key: &str) -> Result<()> {
        let _guard = self.user_locks.acquire(user_id).await;
        self.stores.personas.set(user_id, persona_key)?;
        self.stores.conversations.clear(user_id);
        Ok(())
    }

    pub async fn clear_history(&self, user_id: &str) {
        let _guard = self.user_locks.acquire(user_id).await;
        self.stores.conversations.clear(user_id);
    }

    fn system_prompt(&self, user_id: &str, persona_key: &str) -> String {
        let persona = self.stores.personas.registry().resolve(persona_key);
        let memory = self.stores.memory.render_context(user_id);
        if memory.is_empty() {
            persona.prompt.clone()
        } else {
            format!("{}\n\n{}", persona.prompt, memory)
        }
    }

    async fn complete_with_retry(
        &self,
        request: CompletionRequest,
        modality: Modality,
    ) -> std::result::Result<String, FailureClass> {
        let mut last_failure = FailureClass::Exhausted;

        for attempt in 0..self.retry.max_retry {
            let outcome =
                match tokio::time::timeout(request.timeout, self.completion.complete(request.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CompletionError::Timeout),
                };

            let delay = match outcome {
                Ok(reply) => return Ok(reply),
                Err(CompletionError::ModelUnavailable(detail)) if modality == Modality::Vision => {
                    tracing::error!("Vision model {} unavailable: {}", request.model, detail);
                    return Err(FailureClass::Unavailable);
                }
                Err(CompletionError::Timeout) => {
                    last_failure = FailureClass::Timeout;
                    tracing::warn!(
                        "Completion attempt {}/{} timed out",
                        attempt + 1,
                        self.retry.max_retry
                    );
                    match self.retry.timeout_backoff(attempt) {
                        Some(delay) => delay,
                        None => break,
                    }
                }
                Err(e) => {
                    last_failure = FailureClass::Exhausted;
                    tracing::warn!(
                        "Completion attempt {}/{} failed: {}",
                        attempt + 1,
                        self.retry.max_retry,
                        e
                    );
                    match self.retry.transient_backoff(attempt) {
                        Some(delay) => delay,
                        None => break,
                    }
                }
            };

            tokio::time::sleep(delay).await;
        }

        Err(last_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::PersonaRegistry;
    use crate::store::{InMemoryStore, KeyValueStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Clone)]
    enum Step {
        Reply(String),
        Fail(CompletionError),
        Hang,
    }

    /// Plays back queued steps, then repeats `fallback`. Records every
    /// dispatched request with the (paused-clock) instant it arrived.
    struct ScriptedCompletion {
        steps: Mutex<VecDeque<Step>>,
        fallback: Step,
        calls: Mutex<Vec<(Instant, CompletionRequest)>>,
    }

    impl ScriptedCompletion {
        fn new(steps: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn always(step: Step) -> Arc<Self> {
            Self::new(Vec::new(), step)
        }

        fn calls(&self) -> Vec<(Instant, CompletionRequest)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionApi for ScriptedCompletion {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<String, CompletionError> {
            self.calls.lock().unwrap().push((Instant::now(), request));
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            match step {
                Step::Reply(text) => Ok(text),
                Step::Fail(e) => Err(e),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("too late".to_string())
                }
            }
        }
    }

    struct FixedTranscription(std::result::Result<String, String>);

    #[async_trait]
    impl TranscriptionApi for FixedTranscription {
        async fn transcribe(&self, _audio: Vec<u8>) -> anyhow::Result<String> {
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    /// A backend whose every call fails, like a disk that went away.
    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
            anyhow::bail!("read of {} failed", key)
        }

        fn put(&self, key: &str, _value: &serde_json::Value) -> anyhow::Result<()> {
            anyhow::bail!("write of {} failed", key)
        }

        fn delete(&self, key: &str) -> anyhow::Result<bool> {
            anyhow::bail!("delete of {} failed", key)
        }

        fn list_keys(&self) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("listing failed")
        }
    }

    fn stores_over(backend: impl Fn() -> Arc<dyn KeyValueStore>) -> AgentStores {
        let registry = Arc::new(PersonaRegistry::default());
        AgentStores {
            personas: Arc::new(PersonaSelections::load(registry, backend())),
            memory: Arc::new(MemoryStore::new(backend())),
            stats: Arc::new(StatsStore::new(backend())),
            conversations: Arc::new(ConversationStore::new(backend())),
        }
    }

    fn stores() -> AgentStores {
        stores_over(|| -> Arc<dyn KeyValueStore> { Arc::new(InMemoryStore::new()) })
    }

    fn settings(max_history: usize) -> AgentSettings {
        AgentSettings {
            text_model: "text-model".to_string(),
            vision_model: "vision-model".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            max_history,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retry: 3,
            time_unit: Duration::from_secs(1),
            text_timeout_units: 60,
            vision_timeout_units: 90,
        }
    }

    fn agent(completion: Arc<ScriptedCompletion>, max_history: usize) -> ChatAgent {
        ChatAgent::new(completion, stores(), settings(max_history), policy())
    }

    fn transient() -> Step {
        Step::Fail(CompletionError::Transient("HTTP 500".to_string()))
    }

    fn image(caption: &str) -> ChatInput {
        ChatInput::Image {
            caption: caption.to_string(),
            image: vec![0xff, 0xd8, 0xff],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_capped_at_twice_max_history() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = agent(completion, 3);

        for n in 1..=5usize {
            agent.converse("alice", ChatInput::Text(format!("msg {}", n))).await;
            assert_eq!(
                agent.stores().conversations.len("alice"),
                (2 * n).min(6)
            );
        }

        let history = agent.stores().conversations.get("alice");
        assert_eq!(history[0], ConversationTurn::user("msg 3"));
        assert_eq!(history[5], ConversationTurn::assistant("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_is_trimmed_and_request_carries_history() {
        let completion = ScriptedCompletion::new(
            vec![Step::Reply("  first  \n".to_string())],
            Step::Reply("second".to_string()),
        );
        let agent = agent(completion.clone(), 10);

        assert_eq!(agent.converse("bob", ChatInput::Text("hi".into())).await, "first");
        agent.converse("bob", ChatInput::Text("again".into())).await;

        let calls = completion.calls();
        let second = &calls[1].1;
        assert_eq!(second.model, "text-model");
        assert_eq!(second.timeout, Duration::from_secs(60));
        assert_eq!(second.messages.len(), 4);
        assert_eq!(second.messages[2], Message::from(ConversationTurn::assistant("first")));
        assert_eq!(second.messages[3], Message::user("again"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_get_exactly_one_retry() {
        let completion = ScriptedCompletion::always(Step::Hang);
        let agent = agent(completion.clone(), 10);
        agent.stores().conversations.append("carol", [ConversationTurn::user("earlier")]);
        let before = agent.stores().conversations.get("carol");

        let reply = agent.converse("carol", ChatInput::Text("hello?".into())).await;

        assert_eq!(reply, retry::TEXT_TIMEOUT_REPLY);
        let calls = completion.calls();
        assert_eq!(calls.len(), 2);
        // 60 units waiting on the first attempt, then a fixed 2-unit pause.
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(62));
        assert_eq!(agent.stores().conversations.get("carol"), before);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_exponentially() {
        let completion = ScriptedCompletion::always(transient());
        let agent = agent(completion.clone(), 10);
        let start = Instant::now();

        let reply = agent.converse("dave", ChatInput::Text("hi".into())).await;

        assert_eq!(reply, retry::TEXT_FAILURE_REPLY);
        let calls = completion.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(1));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));
        // No pause after the final attempt.
        assert_eq!(Instant::now() - start, Duration::from_secs(3));
        assert!(agent.stores().conversations.get("dave").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_vision_model_is_not_retried() {
        let completion = ScriptedCompletion::always(Step::Fail(
            CompletionError::ModelUnavailable("HTTP 404".to_string()),
        ));
        let agent = agent(completion.clone(), 10);

        let reply = agent.converse("erin", image("look")).await;

        assert_eq!(reply, retry::VISION_UNAVAILABLE_REPLY);
        assert_ne!(reply, retry::VISION_TIMEOUT_REPLY);
        assert_ne!(reply, retry::VISION_FAILURE_REPLY);
        assert_eq!(completion.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_text_model_is_retried_like_any_failure() {
        let completion = ScriptedCompletion::new(
            vec![Step::Fail(CompletionError::ModelUnavailable("HTTP 404".into()))],
            Step::Reply("recovered".to_string()),
        );
        let agent = agent(completion.clone(), 10);

        let reply = agent.converse("erin", ChatInput::Text("hi".into())).await;
        assert_eq!(reply, "recovered");
        assert_eq!(completion.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn image_uses_vision_model_and_stores_placeholder() {
        let completion = ScriptedCompletion::always(Step::Reply("a cat".to_string()));
        let agent = agent(completion.clone(), 10);

        agent.converse("frank", image("what is this")).await;

        let calls = completion.calls();
        let request = &calls[0].1;
        assert_eq!(request.model, "vision-model");
        assert_eq!(request.timeout, Duration::from_secs(90));
        assert_eq!(
            request.messages[1],
            Message::user_with_image("what is this", "/9j/")
        );

        let history = agent.stores().conversations.get("frank");
        assert_eq!(history[0], ConversationTurn::user("[sent an image] what is this"));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_context_is_appended_only_when_present() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = agent(completion.clone(), 10);

        agent.converse("gina", ChatInput::Text("one".into())).await;
        agent.stores().memory.add("gina", "city", "Lisbon");
        agent.converse("gina", ChatInput::Text("two".into())).await;

        let calls = completion.calls();
        let persona_prompt = agent
            .stores()
            .personas
            .registry()
            .resolve(crate::persona::DEFAULT_PERSONA)
            .prompt
            .clone();
        assert_eq!(calls[0].1.messages[0], Message::system(persona_prompt.clone()));
        assert_eq!(
            calls[1].1.messages[0],
            Message::system(format!(
                "{}\n\n{}\n- city: Lisbon",
                persona_prompt,
                crate::memory::MEMORY_CONTEXT_HEADER
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_attempts_even_on_failure() {
        let completion = ScriptedCompletion::always(transient());
        let agent = agent(completion, 10);

        agent.converse("hank", ChatInput::Text("hi".into())).await;
        agent.converse("hank", ChatInput::Text("hi".into())).await;

        let stats = agent.stores().stats.snapshot("hank").unwrap();
        assert_eq!(stats.total_messages, 2);
        // History stayed empty, so both count as fresh conversations.
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.persona_usage.get(crate::persona::DEFAULT_PERSONA), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_never_block_a_reply() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = ChatAgent::new(
            completion.clone(),
            stores_over(|| -> Arc<dyn KeyValueStore> { Arc::new(FailingStore) }),
            settings(10),
            policy(),
        );

        assert_eq!(agent.converse("olga", ChatInput::Text("one".into())).await, "ok");
        assert_eq!(agent.converse("olga", ChatInput::Text("two".into())).await, "ok");

        // In-memory state keeps going even though nothing reached the backend.
        assert_eq!(agent.stores().conversations.len("olga"), 4);
        assert_eq!(completion.calls()[1].1.messages.len(), 4);
        let stats = agent.stores().stats.snapshot("olga").unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.total_conversations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_history_starts_a_new_conversation() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = agent(completion, 10);

        agent.converse("ivy", ChatInput::Text("a".into())).await;
        agent.converse("ivy", ChatInput::Text("b".into())).await;
        assert_eq!(agent.stores().stats.snapshot("ivy").unwrap().total_conversations, 1);

        agent.clear_history("ivy").await;
        assert_eq!(agent.stores().conversations.len("ivy"), 0);

        agent.converse("ivy", ChatInput::Text("c".into())).await;
        assert_eq!(agent.stores().stats.snapshot("ivy").unwrap().total_conversations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_persona_resets_history() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = agent(completion.clone(), 10);

        agent.converse("jo", ChatInput::Text("hi".into())).await;
        agent.switch_persona("jo", "joker").await.unwrap();
        assert!(agent.stores().conversations.get("jo").is_empty());
        assert!(agent.switch_persona("jo", "nonexistent").await.is_err());

        agent.converse("jo", ChatInput::Text("tell me a joke".into())).await;
        let joker_prompt = agent.stores().personas.registry().resolve("joker").prompt.clone();
        assert_eq!(completion.calls()[1].1.messages[0], Message::system(joker_prompt));
        let stats = agent.stores().stats.snapshot("jo").unwrap();
        assert_eq!(stats.persona_usage.get("joker"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn same_user_requests_are_serialized() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = Arc::new(agent(completion, 10));

        let first = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.converse("kim", ChatInput::Text("1".into())).await })
        };
        let second = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.converse("kim", ChatInput::Text("2".into())).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(agent.stores().conversations.len("kim"), 4);
        let stats = agent.stores().stats.snapshot("kim").unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn user_locks_are_released_when_idle() {
        let completion = ScriptedCompletion::always(Step::Reply("ok".to_string()));
        let agent = Arc::new(agent(completion, 10));

        let held = agent.user_locks.acquire("nia").await;
        assert_eq!(agent.user_locks.len(), 1);

        let waiting = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.converse("nia", ChatInput::Text("hi".into())).await })
        };
        // Wait until the queued request has taken its handle.
        while agent.user_locks.lock_map().get("nia").map(Arc::strong_count) != Some(3) {
            tokio::task::yield_now().await;
        }
        drop(held);
        // The queued request still owns a handle, so the entry survives.
        assert_eq!(agent.user_locks.len(), 1);

        waiting.await.unwrap();
        assert_eq!(agent.user_locks.len(), 0);

        for user in ["a", "b", "c"] {
            agent.converse(user, ChatInput::Text("hi".into())).await;
            agent.clear_history(user).await;
        }
        agent.switch_persona("a", "joker").await.unwrap();
        assert_eq!(agent.user_locks.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_once_leaves_user_state_alone() {
        let completion = ScriptedCompletion::always(Step::Reply(" summary ".to_string()));
        let agent = agent(completion.clone(), 10);

        let reply = agent.complete_once("Summarize.", "lots of chatter").await;

        assert_eq!(reply, "summary");
        let calls = completion.calls();
        assert_eq!(calls[0].1.messages, vec![
            Message::system("Summarize."),
            Message::user("lots of chatter"),
        ]);
        assert!(agent.stores().stats.snapshot("").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn voice_goes_through_the_text_path() {
        let completion = ScriptedCompletion::always(Step::Reply("heard you".to_string()));
        let agent = agent(completion.clone(), 10)
            .with_transcription(Arc::new(FixedTranscription(Ok(" hello there ".into()))));

        let reply = agent.converse_voice("lee", vec![1, 2, 3]).await;

        assert_eq!(reply, "heard you");
        assert_eq!(
            agent.stores().conversations.get("lee")[0],
            ConversationTurn::user("hello there")
        );
        assert_eq!(completion.calls()[0].1.model, "text-model");
    }

    #[tokio::test(start_paused = true)]
    async fn voice_failures_use_fixed_replies() {
        let completion = ScriptedCompletion::always(Step::Reply("unused".to_string()));

        let silent = agent(completion.clone(), 10)
            .with_transcription(Arc::new(FixedTranscription(Ok("   ".into()))));
        assert_eq!(silent.converse_voice("m", vec![0]).await, retry::VOICE_EMPTY_REPLY);

        let broken = agent(completion.clone(), 10)
            .with_transcription(Arc::new(FixedTranscription(Err("HTTP 500".into()))));
        assert_eq!(broken.converse_voice("m", vec![0]).await, retry::VOICE_FAILURE_REPLY);

        let deaf = agent(completion.clone(), 10);
        assert_eq!(deaf.converse_voice("m", vec![0]).await, retry::VOICE_FAILURE_REPLY);

        assert!(completion.calls().is_empty());
    }
}
