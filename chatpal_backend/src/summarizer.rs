//! Plain-text digests of recorded group traffic.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::agent::ChatAgent;
use crate::group_monitor::{count_by_user, ChatStats, GroupMessage};

const MAX_PROMPT_MESSAGES: usize = 100;
const TOP_USERS: usize = 5;
const HEADER_TOP_USERS: usize = 3;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You summarize group chats. Be brief and factual, and never invent messages.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryStats {
    pub total_messages: usize,
    pub active_users: usize,
    pub top_users: Vec<(String, usize)>,
    /// Timestamps of the first and last message.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl SummaryStats {
    fn time_range_label(&self) -> String {
        match self.time_range {
            Some((start, end)) => format!("{} - {}", start.format("%H:%M"), end.format("%H:%M")),
            None => "unknown".to_string(),
        }
    }
}

pub fn calculate_stats(messages: &[GroupMessage]) -> SummaryStats {
    let user_counts = count_by_user(messages);
    SummaryStats {
        total_messages: messages.len(),
        active_users: user_counts.len(),
        top_users: user_counts.into_iter().take(TOP_USERS).collect(),
        time_range: messages
            .first()
            .zip(messages.last())
            .map(|(first, last)| (first.timestamp, last.timestamp)),
    }
}

/// At most `max` messages, evenly spaced across the input.
pub fn sample_messages(messages: &[GroupMessage], max: usize) -> Vec<&GroupMessage> {
    if messages.len() <= max {
        return messages.iter().collect();
    }
    let step = messages.len() / max.max(1);
    messages.iter().step_by(step).take(max).collect()
}

fn format_for_prompt(messages: &[&GroupMessage]) -> String {
    messages
        .iter()
        .map(|msg| {
            format!(
                "[{}] {}: {}",
                msg.timestamp.format("%H:%M"),
                msg.username,
                msg.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_user_lines(users: &[(String, usize)], limit: usize) -> String {
    users
        .iter()
        .take(limit)
        .map(|(name, count)| format!("  - {}: {}\n", name, count))
        .collect()
}

/// Stats-only digest of a chat window, no completion call.
pub fn stats_digest(stats: &ChatStats) -> String {
    if stats.total_messages == 0 {
        return format!("No messages in the last {} hours", stats.hours);
    }
    format!(
        "Chat stats (last {} hours)\n\nMessages: {}\nActive users: {}\n\nMost active:\n{}",
        stats.hours,
        stats.total_messages,
        stats.active_users,
        format_user_lines(&stats.user_counts, TOP_USERS)
    )
}

pub struct MessageSummarizer {
    agent: Arc<ChatAgent>,
}

impl MessageSummarizer {
    pub fn new(agent: Arc<ChatAgent>) -> Self {
        Self { agent }
    }

    pub async fn generate_summary(&self, chat_title: &str, messages: &[GroupMessage]) -> String {
        if messages.is_empty() {
            return "No messages to summarize".to_string();
        }

        let stats = calculate_stats(messages);
        let sampled = sample_messages(messages, MAX_PROMPT_MESSAGES);
        let prompt = format!(
            "Summarize the following group chat.\n\n\
             Messages: {}\nParticipants: {}\n\n\
             Chat log:\n{}\n\n\
             Reply with the main topics (2-3 keywords), the key content in one sentence, \
             and any conclusions reached. Keep it under 100 words.",
            stats.total_messages,
            stats.active_users,
            format_for_prompt(&sampled)
        );
        tracing::debug!(
            "Summarizing {} of {} messages for '{}'",
            sampled.len(),
            messages.len(),
            chat_title
        );

        let ai_summary = self.agent.complete_once(SUMMARY_SYSTEM_PROMPT, &prompt).await;

        format!(
            "Chat summary ({})\n\nGroup: {}\nTime: {}\nMessages: {}\nActive users: {}\n\n\
             Most active:\n{}\nSummary:\n{}",
            Utc::now().format("%Y-%m-%d"),
            chat_title,
            stats.time_range_label(),
            stats.total_messages,
            stats.active_users,
            format_user_lines(&stats.top_users, HEADER_TOP_USERS),
            ai_summary
        )
    }
}
