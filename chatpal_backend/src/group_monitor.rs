//! Records group chat traffic so it can be summarized later.
//!
//! Messages are buffered per chat and merged into a per-day record
//! (`{chat_id}_{YYYY-MM-DD}`) every `flush_every` messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::store::KeyValueStore;

const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub user_id: i64,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStats {
    pub total_messages: usize,
    pub active_users: usize,
    /// Message count per username, busiest first.
    pub user_counts: Vec<(String, usize)>,
    pub hours: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct GroupMonitorSettings {
    pub cache_size: usize,
    pub flush_every: usize,
    pub retention_days: i64,
}

impl GroupMonitorSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            cache_size: config.group_cache_size.max(1),
            flush_every: config.group_flush_every.max(1),
            retention_days: config.group_retention_days,
        }
    }
}

impl Default for GroupMonitorSettings {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

pub fn day_key(chat_id: i64, day: NaiveDate) -> String {
    format!("{}_{}", chat_id, day.format(DAY_KEY_FORMAT))
}

/// Date suffix of a day record key, if it has one.
fn parse_day_key(key: &str) -> Option<NaiveDate> {
    let (_, date) = key.rsplit_once('_')?;
    NaiveDate::parse_from_str(date, DAY_KEY_FORMAT).ok()
}

pub struct GroupMonitor {
    backend: Arc<dyn KeyValueStore>,
    settings: GroupMonitorSettings,
    cache: Mutex<HashMap<i64, Vec<GroupMessage>>>,
}

impl GroupMonitor {
    pub fn new(backend: Arc<dyn KeyValueStore>, settings: GroupMonitorSettings) -> Self {
        Self {
            backend,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Vec<GroupMessage>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_message(&self, chat_id: i64, user_id: i64, username: &str, message: &str) {
        self.record_message_at(chat_id, user_id, username, message, Utc::now());
    }

    pub fn record_message_at(
        &self,
        chat_id: i64,
        user_id: i64,
        username: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let mut cache = self.lock_cache();
        let messages = cache.entry(chat_id).or_default();
        messages.push(GroupMessage {
            user_id,
            username: username.to_string(),
            message: message.to_string(),
            timestamp: now,
        });

        if messages.len() > self.settings.cache_size {
            let excess = messages.len() - self.settings.cache_size;
            messages.drain(..excess);
        }

        if messages.len() % self.settings.flush_every == 0 {
            self.flush_locked(chat_id, messages, now);
        }
    }

    /// Merge the cached messages into today's record. The cache is only
    /// emptied once the write succeeded.
    fn flush_locked(&self, chat_id: i64, messages: &mut Vec<GroupMessage>, now: DateTime<Utc>) {
        if messages.is_empty() {
            return;
        }
        let key = day_key(chat_id, now.date_naive());

        let result = self.load_day(&key).and_then(|mut stored| {
            stored.extend(messages.iter().cloned());
            let value = serde_json::to_value(&stored)?;
            self.backend.put(&key, &value)
        });

        match result {
            Ok(()) => {
                tracing::debug!("Flushed {} message(s) for group {}", messages.len(), chat_id);
                messages.clear();
            }
            Err(e) => tracing::error!("Failed to save messages for group {}: {}", chat_id, e),
        }
    }

    fn load_day(&self, key: &str) -> anyhow::Result<Vec<GroupMessage>> {
        match self.backend.get(key)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_messages(&self, chat_id: i64, hours: i64) -> Vec<GroupMessage> {
        self.get_messages_at(chat_id, hours, Utc::now())
    }

    /// Messages from the last `hours`, cache and stored days combined,
    /// oldest first.
    pub fn get_messages_at(&self, chat_id: i64, hours: i64, now: DateTime<Utc>) -> Vec<GroupMessage> {
        let cutoff = now - Duration::hours(hours);
        let mut messages: Vec<GroupMessage> = self
            .lock_cache()
            .get(&chat_id)
            .map(|cached| {
                cached
                    .iter()
                    .filter(|msg| msg.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // One extra day so a window crossing midnight is fully covered.
        let days_to_check = hours.max(0) / 24 + 2;
        for days_back in 0..days_to_check {
            let day = (now - Duration::days(days_back)).date_naive();
            let key = day_key(chat_id, day);
            match self.load_day(&key) {
                Ok(stored) => {
                    messages.extend(stored.into_iter().filter(|msg| msg.timestamp >= cutoff))
                }
                Err(e) => tracing::error!("Failed to read group messages {}: {}", key, e),
            }
        }

        messages.sort_by_key(|msg| msg.timestamp);
        messages
    }

    pub fn chat_stats(&self, chat_id: i64, hours: i64) -> ChatStats {
        self.chat_stats_at(chat_id, hours, Utc::now())
    }

    pub fn chat_stats_at(&self, chat_id: i64, hours: i64, now: DateTime<Utc>) -> ChatStats {
        let messages = self.get_messages_at(chat_id, hours, now);
        let user_counts = count_by_user(&messages);
        ChatStats {
            total_messages: messages.len(),
            active_users: user_counts.len(),
            user_counts,
            hours,
        }
    }

    pub fn cleanup_old_messages(&self) -> usize {
        self.cleanup_old_messages_at(Utc::now())
    }

    /// Delete day records older than the retention window. Returns how many
    /// were removed.
    pub fn cleanup_old_messages_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(self.settings.retention_days);
        let keys = match self.backend.list_keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!("Failed to list group message records: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            let Some(day) = parse_day_key(&key) else {
                continue;
            };
            let Some(midnight) = day.and_hms_opt(0, 0, 0) else {
                continue;
            };
            if Utc.from_utc_datetime(&midnight) >= cutoff {
                continue;
            }
            match self.backend.delete(&key) {
                Ok(_) => {
                    tracing::info!("Deleted expired group messages {}", key);
                    removed += 1;
                }
                Err(e) => tracing::error!("Failed to delete {}: {}", key, e),
            }
        }
        removed
    }

    /// Flush every non-empty cache. Called on shutdown.
    pub fn save_all(&self) {
        let now = Utc::now();
        let mut cache = self.lock_cache();
        for (chat_id, messages) in cache.iter_mut() {
            self.flush_locked(*chat_id, messages, now);
        }
    }
}

/// Message count per username, busiest first; ties keep first-seen order.
pub fn count_by_user(messages: &[GroupMessage]) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for msg in messages {
        match counts.iter_mut().find(|(name, _)| *name == msg.username) {
            Some((_, count)) => *count += 1,
            None => counts.push((msg.username.clone(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}
