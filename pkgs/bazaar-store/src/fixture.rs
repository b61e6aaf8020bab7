//! Seed data for a [`MemoryRepository`](crate::MemoryRepository)

use bazaar_chat::{Chat, Listing, NewMessage, Profile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::StoreError;

/// Chats, profiles, listings and message history to start a store from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Fixture {
    pub profiles: Vec<Profile>,
    pub listings: Vec<Listing>,
    pub chats: Vec<Chat>,
    /// Inserted in order; ids and timestamps are assigned on load
    pub messages: Vec<NewMessage>,
}

impl Fixture {
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let fixture: Fixture = serde_json::from_str(json)?;
        fixture.validate()?;
        Ok(fixture)
    }

    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// Check that every reference in the fixture resolves
    pub fn validate(&self) -> Result<(), StoreError> {
        let profiles: HashMap<&str, &Profile> =
            self.profiles.iter().map(|p| (p.id.as_str(), p)).collect();
        let listings: HashMap<&str, &Listing> =
            self.listings.iter().map(|l| (l.id.as_str(), l)).collect();
        let chats: HashMap<&str, &Chat> = self.chats.iter().map(|c| (c.id.as_str(), c)).collect();

        for chat in &self.chats {
            for user in [&chat.buyer_id, &chat.seller_id] {
                if !profiles.contains_key(user.as_str()) {
                    return Err(StoreError::InvalidFixture(format!(
                        "chat {} names unknown user {}",
                        chat.id, user
                    )));
                }
            }
            if chat.buyer_id == chat.seller_id {
                return Err(StoreError::InvalidFixture(format!(
                    "chat {} has the same buyer and seller",
                    chat.id
                )));
            }
            let listing = listings.get(chat.listing_id.as_str()).ok_or_else(|| {
                StoreError::InvalidFixture(format!(
                    "chat {} names unknown listing {}",
                    chat.id, chat.listing_id
                ))
            })?;
            if listing.seller_id != chat.seller_id {
                return Err(StoreError::InvalidFixture(format!(
                    "chat {} seller does not own listing {}",
                    chat.id, listing.id
                )));
            }
        }

        for message in &self.messages {
            let chat = chats.get(message.chat_id.as_str()).ok_or_else(|| {
                StoreError::InvalidFixture(format!("message in unknown chat {}", message.chat_id))
            })?;
            if !chat.is_participant(&message.sender_id) {
                return Err(StoreError::InvalidFixture(format!(
                    "{} is not a participant of chat {}",
                    message.sender_id, chat.id
                )));
            }
        }

        Ok(())
    }
}
