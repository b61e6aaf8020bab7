//! Error types for negotiation sessions

use thiserror::Error;

use crate::model::OfferStatus;

/// Faults reported by the chat repository or the notification collaborator
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Conflicting write: {0}")]
    Conflict(String),
    #[error("Listing is sold: {0}")]
    ListingSold(String),
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

/// Faults raised by a realtime transport.
///
/// These never reach the presentation layer: the realtime adapter absorbs them
/// and the polling reconciler compensates for whatever was missed.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors that can occur in a chat session
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("User {user_id} is not a participant of chat {chat_id}")]
    Unauthorized { chat_id: String, user_id: String },
    #[error("Failed to load chat: {0}")]
    LoadError(#[source] RepositoryError),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Failed to send message: {0}")]
    SendFailure(#[source] RepositoryError),
    #[error("Listing already sold: {0}")]
    AlreadySold(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Message carries no offer: {0}")]
    NotAnOffer(String),
    #[error("Offer is already {0}")]
    OfferNotPending(OfferStatus),
    #[error("Not permitted: {0}")]
    NotPermitted(String),
    #[error("Offer update already in progress: {0}")]
    OfferBusy(String),
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),
    #[error("Offer update failed: {0}")]
    OfferWriteFailed(#[source] RepositoryError),
    #[error("Session is closed")]
    SessionClosed,
}

impl ChatError {
    /// Whether the session is still usable after this error.
    ///
    /// Authorization and load faults terminate the session; everything else is
    /// a recoverable failure of a single user action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ChatError::Unauthorized { .. } | ChatError::LoadError(_) | ChatError::SessionClosed
        )
    }
}
