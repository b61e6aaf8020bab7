//! Typing presence
//!
//! Keystrokes are debounced into edge-triggered broadcasts: `typing=true` on
//! the first keystroke of a burst, `typing=false` once the idle timer expires
//! or a message is sent. Presence is never persisted.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Debounces raw input changes into typing broadcasts.
///
/// Every method returns the value to broadcast, if any.
#[derive(Debug)]
pub struct TypingDebouncer {
    idle_timeout: Duration,
    deadline: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            deadline: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the idle timer fires, if running
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Input changed: (re)start the idle timer
    pub fn input_changed(&mut self, now: Instant) -> Option<bool> {
        let was_typing = self.is_typing();
        self.deadline = Some(now + self.idle_timeout);
        (!was_typing).then_some(true)
    }

    /// A message was sent: stop immediately
    pub fn message_sent(&mut self) -> Option<bool> {
        self.deadline.take().map(|_| false)
    }

    /// Idle timer check
    pub fn expire(&mut self, now: Instant) -> Option<bool> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(false)
            }
            _ => None,
        }
    }
}

/// Whether anyone other than `self_id` is marked typing in a presence sync
pub fn others_typing(roster: &HashMap<String, bool>, self_id: &str) -> bool {
    roster
        .iter()
        .any(|(participant, typing)| *typing && participant != self_id)
}
