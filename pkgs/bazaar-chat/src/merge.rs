//! Message merge shared by every delivery path
//!
//! Realtime events and reconciliation polls both funnel through
//! [`merge_message`], so duplicate or out-of-order delivery from either source
//! converges on the same list.
//!
//! # Ordering
//!
//! Confirmed messages are ordered by `(created_at, id)`. Local optimistic
//! messages always sort after confirmed ones, in submission order.

use std::cmp::Ordering;

use crate::model::Message;

/// What a merge did to the local list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Totals for a batch merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// Display order of two messages
pub fn display_order(a: &Message, b: &Message) -> Ordering {
    a.pending
        .cmp(&b.pending)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Restore display order after an in-place change
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(display_order);
}

/// Merge one server message into the local list.
///
/// An existing entry with the same id is overwritten in place, except that a
/// known `read_at` is never cleared and a terminal offer status never goes back
/// to pending. Unknown ids are inserted and the list re-sorted.
pub fn merge_message(messages: &mut Vec<Message>, incoming: Message) -> MergeOutcome {
    match messages.iter().position(|m| m.id == incoming.id) {
        Some(index) => {
            let merged = overlay(&messages[index], incoming);
            if merged == messages[index] {
                return MergeOutcome::Unchanged;
            }
            let reorder = merged.created_at != messages[index].created_at;
            messages[index] = merged;
            if reorder {
                sort_messages(messages);
            }
            MergeOutcome::Updated
        }
        None => {
            messages.push(incoming);
            sort_messages(messages);
            MergeOutcome::Inserted
        }
    }
}

/// Merge a batch, typically a full poll result
pub fn merge_all<I>(messages: &mut Vec<Message>, incoming: I) -> MergeSummary
where
    I: IntoIterator<Item = Message>,
{
    let mut summary = MergeSummary::default();
    for message in incoming {
        match merge_message(messages, message) {
            MergeOutcome::Inserted => summary.inserted += 1,
            MergeOutcome::Updated => summary.updated += 1,
            MergeOutcome::Unchanged => {}
        }
    }
    summary
}

/// Merge a server copy of a message the local user sent.
///
/// A copy whose id is not known yet takes the place of a local optimistic
/// message for the same submission, `local_id` first when given, so the
/// sender never sees both. Known ids merge as usual.
pub fn merge_own(
    messages: &mut Vec<Message>,
    incoming: Message,
    local_id: Option<&str>,
) -> MergeOutcome {
    if messages.iter().any(|m| m.id == incoming.id) {
        return merge_message(messages, incoming);
    }

    let slot = local_id
        .and_then(|id| messages.iter().position(|m| m.id == id && m.is_local()))
        .or_else(|| {
            messages
                .iter()
                .position(|m| m.is_local() && m.same_submission(&incoming))
        });
    match slot {
        Some(index) => {
            messages[index] = incoming;
            sort_messages(messages);
            MergeOutcome::Inserted
        }
        None => merge_message(messages, incoming),
    }
}

/// Number of local optimistic messages in the list
pub fn local_count(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_local()).count()
}

/// Remove a local optimistic message, returning it
pub fn discard_local(messages: &mut Vec<Message>, local_id: &str) -> Option<Message> {
    let index = messages
        .iter()
        .position(|m| m.id == local_id && m.is_local())?;
    Some(messages.remove(index))
}

fn overlay(existing: &Message, mut incoming: Message) -> Message {
    if incoming.read_at.is_none() {
        incoming.read_at = existing.read_at;
    }
    if let (Some(known), Some(offer)) = (&existing.offer, incoming.offer.as_mut()) {
        if known.status.is_terminal() && !offer.status.is_terminal() {
            offer.status = known.status;
        }
    }
    incoming
}
