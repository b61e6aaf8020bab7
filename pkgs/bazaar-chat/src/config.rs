//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted poll interval (one day)
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 86_400;

/// Longest accepted typing idle time and resubscribe delay (one hour)
pub const MAX_DELAY_MILLIS: u64 = 3_600_000;

/// Configuration for a chat session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval in seconds between reconciliation polls (default: 5s)
    pub poll_interval_seconds: u64,

    /// Idle time in milliseconds after the last keystroke before typing stops (default: 2000ms)
    pub typing_idle_millis: u64,

    /// First delay in milliseconds before resubscribing a dropped channel (default: 500ms)
    pub resubscribe_initial_backoff_millis: u64,

    /// Upper bound in milliseconds for the resubscribe delay (default: 30s)
    pub resubscribe_max_backoff_millis: u64,

    /// Prefix for links carried by notifications, the chat id is appended
    pub notification_link_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            typing_idle_millis: 2000,
            resubscribe_initial_backoff_millis: 500,
            resubscribe_max_backoff_millis: 30_000,
            notification_link_prefix: "/chats/".to_string(),
        }
    }
}

/// Durations are clamped so deadlines computed from them stay representable.
impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.clamp(1, MAX_POLL_INTERVAL_SECONDS))
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_millis.min(MAX_DELAY_MILLIS))
    }

    pub fn resubscribe_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_initial_backoff_millis.min(MAX_DELAY_MILLIS))
    }

    pub fn resubscribe_max_backoff(&self) -> Duration {
        Duration::from_millis(
            self.resubscribe_max_backoff_millis
                .max(self.resubscribe_initial_backoff_millis)
                .min(MAX_DELAY_MILLIS),
        )
    }

    /// Link to a chat, as carried by notifications
    pub fn chat_link(&self, chat_id: &str) -> String {
        format!("{}{}", self.notification_link_prefix, chat_id)
    }
}
