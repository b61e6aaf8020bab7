//! Collaborators a session depends on
//!
//! The persisted store of chats, messages and listings is external to this
//! crate; sessions reach it only through [`ChatRepository`].

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::model::{Chat, Listing, Message, NewMessage, OfferStatus, Profile};

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalWrite {
    /// `false` when the guard no longer held at write time
    pub applied: bool,
}

/// Persisted store of chats, messages and listing sold-state
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn get_chat(&self, chat_id: &str) -> Result<Chat, RepositoryError>;

    async fn get_profile(&self, user_id: &str) -> Result<Profile, RepositoryError>;

    async fn get_listing(&self, listing_id: &str) -> Result<Listing, RepositoryError>;

    /// All messages of a chat, ascending by `created_at`
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, RepositoryError>;

    /// Persist a message; the store assigns `id` and `created_at`
    async fn insert_message(&self, message: NewMessage) -> Result<Message, RepositoryError>;

    async fn mark_read(&self, message_ids: &[String]) -> Result<(), RepositoryError>;

    async fn set_offer_status(
        &self,
        message_id: &str,
        status: OfferStatus,
    ) -> Result<(), RepositoryError>;

    /// Set the sold flag only if it currently equals `expected_current`
    async fn set_listing_sold(
        &self,
        listing_id: &str,
        sold: bool,
        expected_current: bool,
    ) -> Result<ConditionalWrite, RepositoryError>;
}
