//! Retry budget, backoff schedule and the degraded replies used when a
//! completion cannot be obtained.

use std::time::Duration;

use crate::config::BotConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Vision,
}

/// Why a completion ultimately failed; selects the degraded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The vision model does not exist. Terminal on the first attempt.
    Unavailable,
    /// The last attempt timed out.
    Timeout,
    /// Retries exhausted on any other error.
    Exhausted,
}

/// Extra attempts allowed after a timeout, regardless of `max_retry`.
const TIMEOUT_RETRIES: u32 = 1;
const TIMEOUT_RETRY_DELAY_UNITS: u32 = 2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub time_unit: Duration,
    pub text_timeout_units: u32,
    pub vision_timeout_units: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            max_retry: config.max_api_retry,
            time_unit: config.retry_time_unit(),
            text_timeout_units: config.text_timeout_units,
            vision_timeout_units: config.vision_timeout_units,
        }
    }

    pub fn timeout_for(&self, modality: Modality) -> Duration {
        let units = match modality {
            Modality::Text => self.text_timeout_units,
            Modality::Vision => self.vision_timeout_units,
        };
        self.time_unit * units
    }

    /// Delay after a failed `attempt` (zero-based) before trying again, or
    /// `None` when that attempt was the last one allowed.
    pub fn transient_backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_retry {
            return None;
        }
        Some(self.time_unit * 2u32.saturating_pow(attempt))
    }

    /// Delay after a timed-out `attempt`, or `None` when timeouts have used up
    /// their budget.
    pub fn timeout_backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= TIMEOUT_RETRIES || attempt + 1 >= self.max_retry {
            return None;
        }
        Some(self.time_unit * TIMEOUT_RETRY_DELAY_UNITS)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

pub const TEXT_TIMEOUT_REPLY: &str = "The network is a bit slow|||Try again in a moment";
pub const TEXT_FAILURE_REPLY: &str = "Something went wrong on my side|||Give it another try in a bit";
pub const VISION_TIMEOUT_REPLY: &str = "Looking at that image took too long|||Try again in a moment";
pub const VISION_FAILURE_REPLY: &str = "I couldn't make out that image|||Please try again later";
pub const VISION_UNAVAILABLE_REPLY: &str = "I can't look at images right now|||Try again a bit later";
pub const VOICE_EMPTY_REPLY: &str = "Sorry, I couldn't hear anything in that voice message";
pub const VOICE_FAILURE_REPLY: &str = "Sorry, voice recognition failed, please try again later";

/// User-safe text for a failed completion. Never includes error details.
pub fn degraded_reply(modality: Modality, class: FailureClass) -> &'static str {
    match (modality, class) {
        (Modality::Vision, FailureClass::Unavailable) => VISION_UNAVAILABLE_REPLY,
        (Modality::Vision, FailureClass::Timeout) => VISION_TIMEOUT_REPLY,
        (Modality::Vision, FailureClass::Exhausted) => VISION_FAILURE_REPLY,
        (Modality::Text, FailureClass::Timeout) => TEXT_TIMEOUT_REPLY,
        // Text requests never classify as unavailable; keep the generic reply.
        (Modality::Text, FailureClass::Unavailable | FailureClass::Exhausted) => {
            TEXT_FAILURE_REPLY
        }
    }
}
