//! Read receipts
//!
//! Only the recipient of a message ever stamps its `read_at`.

use chrono::{DateTime, Utc};

use crate::model::Message;

/// Ids of counterpart messages `current_user` has not read yet
pub fn unread_from_counterpart(messages: &[Message], current_user: &str) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.is_unread_for(current_user))
        .map(|m| m.id.clone())
        .collect()
}

/// Stamp `ids` as read at `at`, skipping anything already read
pub fn stamp_read(messages: &mut [Message], ids: &[String], at: DateTime<Utc>) -> usize {
    let mut stamped = 0;
    for message in messages.iter_mut() {
        if message.read_at.is_none() && ids.contains(&message.id) {
            message.read_at = Some(at);
            stamped += 1;
        }
    }
    stamped
}

/// Undo [`stamp_read`] after the repository refused the batch.
///
/// Only stamps still carrying `at` are cleared, so newer server values survive.
pub fn revert_read(messages: &mut [Message], ids: &[String], at: DateTime<Utc>) -> usize {
    let mut reverted = 0;
    for message in messages.iter_mut() {
        if message.read_at == Some(at) && ids.contains(&message.id) {
            message.read_at = None;
            reverted += 1;
        }
    }
    reverted
}
