//! Per-user usage counters and derived summaries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KeyValueStore;

const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatsRecord {
    pub total_messages: u64,
    pub total_conversations: u64,
    pub first_use: DateTime<Utc>,
    pub last_use: DateTime<Utc>,
    #[serde(default)]
    pub persona_usage: BTreeMap<String, u64>,
    #[serde(default)]
    pub daily_messages: BTreeMap<String, u64>,
}

impl UserStatsRecord {
    /// Zeroed counters, first and last use both at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_messages: 0,
            total_conversations: 0,
            first_use: now,
            last_use: now,
            persona_usage: BTreeMap::new(),
            daily_messages: BTreeMap::new(),
        }
    }

    /// Highest-count persona; ties go to the lexicographically smallest key.
    pub fn favorite_persona(&self) -> Option<&str> {
        self.persona_usage
            .iter()
            .fold(None, |best: Option<(&String, u64)>, (key, &count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((key, count)),
            })
            .map(|(key, _)| key.as_str())
    }

    /// Whole days since first use, counting the first day.
    pub fn days_used(&self, now: DateTime<Utc>) -> i64 {
        (now - self.first_use).num_days().max(0) + 1
    }

    pub fn avg_daily_messages(&self, now: DateTime<Utc>) -> f64 {
        let days = self.days_used(now);
        if days <= 0 {
            return 0.0;
        }
        let avg = self.total_messages as f64 / days as f64;
        (avg * 10.0).round() / 10.0
    }

    pub fn summary(&self, now: DateTime<Utc>) -> UserStatsSummary {
        UserStatsSummary {
            total_messages: self.total_messages,
            total_conversations: self.total_conversations,
            days_used: self.days_used(now),
            first_use: self.first_use,
            last_use: self.last_use,
            favorite_persona: self.favorite_persona().map(str::to_string),
            persona_usage: self.persona_usage.clone(),
            avg_daily_messages: self.avg_daily_messages(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStatsSummary {
    pub total_messages: u64,
    pub total_conversations: u64,
    pub days_used: i64,
    pub first_use: DateTime<Utc>,
    pub last_use: DateTime<Utc>,
    pub favorite_persona: Option<String>,
    pub persona_usage: BTreeMap<String, u64>,
    pub avg_daily_messages: f64,
}

/// Monotonic usage counters, created lazily on the first event for a user.
pub struct StatsStore {
    backend: Arc<dyn KeyValueStore>,
    records: Mutex<HashMap<String, Option<UserStatsRecord>>>,
}

impl StatsStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn load_user(&self, user_id: &str) -> Option<UserStatsRecord> {
        match self.backend.get(user_id) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Discarding unreadable stats for {}: {}", user_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to load stats for {}: {}", user_id, e);
                None
            }
        }
    }

    /// Apply `f` to the user's record, creating it if absent, then persist.
    fn mutate(&self, user_id: &str, now: DateTime<Utc>, f: impl FnOnce(&mut UserStatsRecord)) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let slot = records
            .entry(user_id.to_string())
            .or_insert_with(|| self.load_user(user_id));
        let record = slot.get_or_insert_with(|| UserStatsRecord::new(now));
        f(record);

        let result = serde_json::to_value(&*record)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.backend.put(user_id, &value));
        if let Err(e) = result {
            tracing::error!("Failed to persist stats for {}: {}", user_id, e);
        }
    }

    pub fn record_message(&self, user_id: &str, persona_key: &str) {
        self.record_message_at(user_id, persona_key, Utc::now());
    }

    pub fn record_message_at(&self, user_id: &str, persona_key: &str, now: DateTime<Utc>) {
        self.mutate(user_id, now, |record| {
            record.total_messages += 1;
            record.last_use = now;
            *record
                .persona_usage
                .entry(persona_key.to_string())
                .or_insert(0) += 1;
            *record
                .daily_messages
                .entry(now.format(DAY_KEY_FORMAT).to_string())
                .or_insert(0) += 1;
        });
    }

    pub fn record_conversation(&self, user_id: &str) {
        self.mutate(user_id, Utc::now(), |record| {
            record.total_conversations += 1;
        });
    }

    pub fn snapshot(&self, user_id: &str) -> Option<UserStatsRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry(user_id.to_string())
            .or_insert_with(|| self.load_user(user_id))
            .clone()
    }

    pub fn summary(&self, user_id: &str) -> Option<UserStatsSummary> {
        self.snapshot(user_id).map(|record| record.summary(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone};

    fn store() -> (Arc<InMemoryStore>, StatsStore) {
        let backend = Arc::new(InMemoryStore::new());
        (backend.clone(), StatsStore::new(backend))
    }

    #[test]
    fn snapshot_is_absent_before_any_event() {
        let (_backend, stats) = store();
        assert!(stats.snapshot("alice").is_none());
        assert!(stats.summary("alice").is_none());
    }

    #[test]
    fn record_message_increments_total_and_persona_by_one() {
        let (_backend, stats) = store();
        stats.record_message("alice", "joker");
        let before = stats.snapshot("alice").unwrap();

        stats.record_message("alice", "joker");
        let after = stats.snapshot("alice").unwrap();

        assert_eq!(after.total_messages, before.total_messages + 1);
        assert_eq!(after.persona_usage["joker"], before.persona_usage["joker"] + 1);
        assert_eq!(after.first_use, before.first_use);
        assert!(after.last_use >= before.last_use);
    }

    #[test]
    fn daily_histogram_buckets_by_date() {
        let (_backend, stats) = store();
        let day_one = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let day_two = day_one + Duration::days(1);

        stats.record_message_at("bob", "assistant", day_one);
        stats.record_message_at("bob", "assistant", day_one + Duration::hours(2));
        stats.record_message_at("bob", "scholar", day_two);

        let record = stats.snapshot("bob").unwrap();
        assert_eq!(record.daily_messages["2026-03-01"], 2);
        assert_eq!(record.daily_messages["2026-03-02"], 1);
        assert_eq!(record.first_use, day_one);
        assert_eq!(record.last_use, day_two);
    }

    #[test]
    fn record_conversation_creates_record_lazily() {
        let (backend, stats) = store();
        stats.record_conversation("carol");
        stats.record_conversation("carol");

        let record = stats.snapshot("carol").unwrap();
        assert_eq!(record.total_conversations, 2);
        assert_eq!(record.total_messages, 0);

        let reloaded = StatsStore::new(backend);
        assert_eq!(reloaded.snapshot("carol").unwrap().total_conversations, 2);
    }

    #[test]
    fn summary_reports_totals_and_favorite() {
        let (_backend, stats) = store();
        stats.record_conversation("dana");
        stats.record_message("dana", "pirate");
        stats.record_message("dana", "pirate");
        stats.record_message("dana", "scholar");

        let summary = stats.summary("dana").unwrap();
        assert_eq!(summary.total_messages, 3);
        assert_eq!(summary.total_conversations, 1);
        assert_eq!(summary.days_used, 1);
        assert_eq!(summary.favorite_persona.as_deref(), Some("pirate"));
        assert_eq!(summary.persona_usage["scholar"], 1);
        assert_eq!(summary.avg_daily_messages, 3.0);
    }

    #[test]
    fn favorite_persona_breaks_ties_by_smallest_key() {
        let now = Utc::now();
        let mut record = UserStatsRecord::new(now);
        assert!(record.favorite_persona().is_none());

        record.persona_usage.insert("scholar".to_string(), 3);
        record.persona_usage.insert("joker".to_string(), 3);
        record.persona_usage.insert("assistant".to_string(), 1);
        assert_eq!(record.favorite_persona(), Some("joker"));

        record.persona_usage.insert("assistant".to_string(), 4);
        assert_eq!(record.favorite_persona(), Some("assistant"));
    }

    #[test]
    fn derived_metrics_count_first_day_inclusive() {
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let mut record = UserStatsRecord::new(first);
        record.total_messages = 10;

        assert_eq!(record.days_used(first), 1);
        assert_eq!(record.avg_daily_messages(first), 10.0);

        let later = first + Duration::days(3) + Duration::hours(1);
        assert_eq!(record.days_used(later), 4);
        assert_eq!(record.avg_daily_messages(later), 2.5);

        record.total_messages = 0;
        assert_eq!(record.avg_daily_messages(later), 0.0);
    }
}
