//! What the presentation layer sees of a session

use crate::model::{Chat, Listing, Message, OfferStatus, Profile};

/// Snapshot of a session, republished after every state change
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub chat: Chat,
    /// The other participant
    pub counterpart: Profile,
    pub listing: Listing,
    /// Confirmed messages ordered by `(created_at, id)`, then local ones
    pub messages: Vec<Message>,
    /// Current contents of the input box
    pub draft: String,
    pub counterpart_typing: bool,
    pub closed: bool,
}

impl SessionView {
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Local optimistic messages still awaiting acknowledgment
    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.pending).count()
    }

    pub fn unread_count(&self, user_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_unread_for(user_id))
            .count()
    }
}

/// One-off user-facing events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A write failed and was rolled back. `text` is what went back into the input.
    SendFailed {
        text: Option<String>,
        reason: String,
    },
    /// Accepting `message_id` lost against a sale that already happened
    AlreadySold { message_id: String },
    /// An offer answered from this session reached a terminal state
    OfferSettled {
        message_id: String,
        status: OfferStatus,
    },
}
