//! In-memory chat repository
//!
//! Holds chats, profiles, listings and messages behind one lock, assigns
//! message ids and strictly increasing timestamps, and publishes every insert
//! and update to an optional [`RealtimeHub`]. Faults can be injected per
//! operation and writes can be held back, which is how the session's rollback,
//! race and recovery paths are exercised.

use async_trait::async_trait;
use bazaar_chat::{
    ChangeKind, Chat, ChatRepository, ConditionalWrite, Listing, Message, NewMessage, OfferStatus,
    Profile, RepositoryError, TransportEvent,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fixture::Fixture;
use crate::realtime_hub::RealtimeHub;

/// Repository operations a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetChat,
    GetProfile,
    GetListing,
    ListMessages,
    InsertMessage,
    MarkRead,
    SetOfferStatus,
    SetListingSold,
}

#[derive(Default)]
struct State {
    chats: HashMap<String, Chat>,
    profiles: HashMap<String, Profile>,
    listings: HashMap<String, Listing>,
    /// Kept in insertion order, which is also `created_at` order
    messages: Vec<Message>,
    last_created_at: Option<DateTime<Utc>>,
    faults: HashMap<Operation, usize>,
    calls: HashMap<Operation, usize>,
    write_delay: Option<Duration>,
}

impl State {
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created_at = match self.last_created_at {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(created_at);
        created_at
    }

    /// Count the call and consume one injected fault, if any
    fn enter(&mut self, operation: Operation) -> Result<(), RepositoryError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        match self.faults.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RepositoryError::Unavailable(format!(
                    "injected {:?} failure",
                    operation
                )))
            }
            _ => Ok(()),
        }
    }

    fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

/// Chat repository kept entirely in memory
pub struct MemoryRepository {
    state: Mutex<State>,
    hub: Option<RealtimeHub>,
    writes_open: watch::Sender<bool>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            hub: None,
            writes_open: watch::Sender::new(true),
        }
    }

    /// Publish inserts and updates to `hub`
    pub fn with_hub(hub: RealtimeHub) -> Self {
        Self {
            hub: Some(hub),
            ..Self::new()
        }
    }

    /// Build a repository seeded from `fixture`
    pub fn from_fixture(fixture: Fixture, hub: Option<RealtimeHub>) -> Self {
        let repository = Self {
            hub,
            ..Self::new()
        };
        for profile in fixture.profiles {
            repository.add_profile(profile);
        }
        for listing in fixture.listings {
            repository.add_listing(listing);
        }
        for chat in fixture.chats {
            repository.add_chat(chat);
        }
        for message in fixture.messages {
            repository.seed_message(message);
        }
        info!(
            "Memory repository seeded with {} messages",
            repository.state.lock().messages.len()
        );
        repository
    }

    pub fn add_profile(&self, profile: Profile) {
        self.state.lock().profiles.insert(profile.id.clone(), profile);
    }

    pub fn add_listing(&self, listing: Listing) {
        self.state.lock().listings.insert(listing.id.clone(), listing);
    }

    pub fn add_chat(&self, chat: Chat) {
        self.state.lock().chats.insert(chat.id.clone(), chat);
    }

    /// Insert a message directly, bypassing faults, delays and the hub
    pub fn seed_message(&self, message: NewMessage) -> Message {
        let mut state = self.state.lock();
        let stored = Self::build(&mut state, message);
        state.messages.push(stored.clone());
        stored
    }

    /// Make the next `count` calls of `operation` fail with `Unavailable`
    pub fn fail_next(&self, operation: Operation, count: usize) {
        self.state.lock().faults.insert(operation, count);
    }

    /// How often `operation` was called
    pub fn calls(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Delay every write by `delay`
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().write_delay = delay;
    }

    /// Hold every write until [`resume_writes`](Self::resume_writes)
    pub fn pause_writes(&self) {
        self.writes_open.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.writes_open.send_replace(true);
    }

    pub fn listing(&self, listing_id: &str) -> Option<Listing> {
        self.state.lock().listings.get(listing_id).cloned()
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.state
            .lock()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    fn build(state: &mut State, message: NewMessage) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: state.next_created_at(),
            read_at: None,
            offer: message.offer,
            pending: false,
        }
    }

    async fn before_write(&self) {
        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut open = self.writes_open.subscribe();
        // the sender lives as long as `self`
        let _ = open.wait_for(|open| *open).await;
    }

    fn publish(&self, kind: ChangeKind, message: Message) {
        if let Some(hub) = &self.hub {
            let chat_id = message.chat_id.clone();
            hub.publish(&chat_id, TransportEvent::MessageChanged { kind, message });
        }
    }
}

#[async_trait]
impl ChatRepository for MemoryRepository {
    async fn get_chat(&self, chat_id: &str) -> Result<Chat, RepositoryError> {
        let mut state = self.state.lock();
        state.enter(Operation::GetChat)?;
        state
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("chat {}", chat_id)))
    }

    async fn get_profile(&self, user_id: &str) -> Result<Profile, RepositoryError> {
        let mut state = self.state.lock();
        state.enter(Operation::GetProfile)?;
        state
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("profile {}", user_id)))
    }

    async fn get_listing(&self, listing_id: &str) -> Result<Listing, RepositoryError> {
        let mut state = self.state.lock();
        state.enter(Operation::GetListing)?;
        state
            .listings
            .get(listing_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("listing {}", listing_id)))
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, RepositoryError> {
        let mut state = self.state.lock();
        state.enter(Operation::ListMessages)?;
        let messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        debug!("Listed {} messages of {}", messages.len(), chat_id);
        Ok(messages)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, RepositoryError> {
        self.before_write().await;

        let stored = {
            let mut state = self.state.lock();
            state.enter(Operation::InsertMessage)?;
            let chat = state
                .chats
                .get(&message.chat_id)
                .ok_or_else(|| RepositoryError::NotFound(format!("chat {}", message.chat_id)))?;
            if !chat.is_participant(&message.sender_id) {
                return Err(RepositoryError::Conflict(format!(
                    "{} is not a participant of chat {}",
                    message.sender_id, message.chat_id
                )));
            }
            if let Some(offer) = &message.offer {
                let listing = state.listings.get(&chat.listing_id).ok_or_else(|| {
                    RepositoryError::NotFound(format!("listing {}", chat.listing_id))
                })?;
                if listing.sold {
                    return Err(RepositoryError::ListingSold(listing.id.clone()));
                }
                if offer.status != OfferStatus::Pending || !offer.is_consistent_with(listing) {
                    return Err(RepositoryError::Conflict(
                        "offer does not match the listing price".to_string(),
                    ));
                }
            }

            let stored = Self::build(&mut state, message);
            state.messages.push(stored.clone());
            stored
        };

        debug!("Stored message {} in {}", stored.id, stored.chat_id);
        self.publish(ChangeKind::Insert, stored.clone());
        Ok(stored)
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<(), RepositoryError> {
        self.before_write().await;

        let updated: Vec<Message> = {
            let mut state = self.state.lock();
            state.enter(Operation::MarkRead)?;
            let now = Utc::now();
            state
                .messages
                .iter_mut()
                .filter(|m| m.read_at.is_none() && message_ids.contains(&m.id))
                .map(|m| {
                    m.read_at = Some(now);
                    m.clone()
                })
                .collect()
        };

        debug!("Marked {} messages as read", updated.len());
        for message in updated {
            self.publish(ChangeKind::Update, message);
        }
        Ok(())
    }

    async fn set_offer_status(
        &self,
        message_id: &str,
        status: OfferStatus,
    ) -> Result<(), RepositoryError> {
        self.before_write().await;

        let updated = {
            let mut state = self.state.lock();
            state.enter(Operation::SetOfferStatus)?;
            let message = state
                .message_mut(message_id)
                .ok_or_else(|| RepositoryError::NotFound(format!("message {}", message_id)))?;
            let offer = message.offer.as_mut().ok_or_else(|| {
                RepositoryError::Conflict(format!("message {} carries no offer", message_id))
            })?;
            if offer.status.is_terminal() {
                warn!(
                    "Refusing to move offer {} from {} to {}",
                    message_id, offer.status, status
                );
                return Err(RepositoryError::Conflict(format!(
                    "offer {} is already {}",
                    message_id, offer.status
                )));
            }
            offer.status = status;
            message.clone()
        };

        info!("Offer {} is now {}", message_id, status);
        self.publish(ChangeKind::Update, updated);
        Ok(())
    }

    async fn set_listing_sold(
        &self,
        listing_id: &str,
        sold: bool,
        expected_current: bool,
    ) -> Result<ConditionalWrite, RepositoryError> {
        self.before_write().await;

        let mut state = self.state.lock();
        state.enter(Operation::SetListingSold)?;
        let listing = state
            .listings
            .get_mut(listing_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("listing {}", listing_id)))?;
        if listing.sold != expected_current {
            debug!(
                "Conditional write on {} not applied (sold = {})",
                listing_id, listing.sold
            );
            return Ok(ConditionalWrite { applied: false });
        }
        listing.sold = sold;
        info!("Listing {} sold = {}", listing_id, sold);
        Ok(ConditionalWrite { applied: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_chat::{Offer, OfferExtra};

    fn repository() -> MemoryRepository {
        let repository = MemoryRepository::new();
        repository.add_profile(Profile {
            id: "buyer".to_string(),
            display_name: "Ayşe".to_string(),
        });
        repository.add_profile(Profile {
            id: "seller".to_string(),
            display_name: "Mehmet".to_string(),
        });
        repository.add_listing(Listing {
            id: "listing-1".to_string(),
            seller_id: "seller".to_string(),
            title: "Camping van".to_string(),
            base_price: 100.0,
            daily_surcharge: 20.0,
            sold: false,
        });
        repository.add_chat(Chat {
            id: "chat-1".to_string(),
            buyer_id: "buyer".to_string(),
            seller_id: "seller".to_string(),
            listing_id: "listing-1".to_string(),
        });
        repository
    }

    fn text(content: &str) -> NewMessage {
        NewMessage {
            chat_id: "chat-1".to_string(),
            sender_id: "buyer".to_string(),
            content: content.to_string(),
            offer: None,
        }
    }

    fn offer(repository: &MemoryRepository) -> NewMessage {
        let listing = repository.listing("listing-1").unwrap();
        let offer = Offer::compose(&listing, 3, vec![OfferExtra::new("bikes", "Bike rack", 15.0)])
            .unwrap();
        NewMessage {
            content: offer.summary(),
            offer: Some(offer),
            ..text("")
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_timestamps() {
        let repository = repository();
        let first = repository.insert_message(text("Merhaba")).await.unwrap();
        let second = repository.insert_message(text("Hello")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.created_at > first.created_at);
        let listed = repository.list_messages("chat-1").await.unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[tokio::test]
    async fn test_insert_rejects_outsider() {
        let repository = repository();
        let mut message = text("hi");
        message.sender_id = "mallory".to_string();
        let result = repository.insert_message(message).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_insert_rejects_mispriced_offer() {
        let repository = repository();
        let mut message = offer(&repository);
        if let Some(offer) = message.offer.as_mut() {
            offer.total_price = 1.0;
        }
        let result = repository.insert_message(message).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed() {
        let repository = repository();
        repository.fail_next(Operation::InsertMessage, 1);

        assert!(repository.insert_message(text("one")).await.is_err());
        assert!(repository.insert_message(text("two")).await.is_ok());
        assert_eq!(repository.calls(Operation::InsertMessage), 2);
        assert_eq!(repository.messages("chat-1").len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_sold_write() {
        let repository = repository();

        let first = repository
            .set_listing_sold("listing-1", true, false)
            .await
            .unwrap();
        let second = repository
            .set_listing_sold("listing-1", true, false)
            .await
            .unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert!(repository.listing("listing-1").unwrap().sold);
    }

    #[tokio::test]
    async fn test_offer_on_sold_listing_is_refused() {
        let repository = repository();
        let request = offer(&repository);
        repository
            .set_listing_sold("listing-1", true, false)
            .await
            .unwrap();

        let result = repository.insert_message(request).await;
        assert!(matches!(result, Err(RepositoryError::ListingSold(id)) if id == "listing-1"));

        // plain messages are still accepted
        assert!(repository.insert_message(text("Satıldı mı?")).await.is_ok());
    }

    #[tokio::test]
    async fn test_terminal_offer_status_is_final() {
        let repository = repository();
        let stored = repository.insert_message(offer(&repository)).await.unwrap();

        repository
            .set_offer_status(&stored.id, OfferStatus::Rejected)
            .await
            .unwrap();
        let result = repository
            .set_offer_status(&stored.id, OfferStatus::Accepted)
            .await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        assert_eq!(
            repository.message(&stored.id).unwrap().offer_status(),
            Some(OfferStatus::Rejected)
        );
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let repository = repository();
        let stored = repository.insert_message(text("Merhaba")).await.unwrap();
        let ids = vec![stored.id.clone()];

        repository.mark_read(&ids).await.unwrap();
        let first = repository.message(&stored.id).unwrap().read_at;
        repository.mark_read(&ids).await.unwrap();
        let second = repository.message(&stored.id).unwrap().read_at;

        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_inserts_reach_hub_subscribers() {
        use bazaar_chat::Transport;

        let hub = RealtimeHub::new();
        let repository = MemoryRepository::with_hub(hub.clone());
        repository.add_chat(Chat {
            id: "chat-1".to_string(),
            buyer_id: "buyer".to_string(),
            seller_id: "seller".to_string(),
            listing_id: "listing-1".to_string(),
        });
        let (_handle, mut events) = hub.subscribe("chat-1", "seller").await.unwrap();

        let stored = repository.insert_message(text("Merhaba")).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                TransportEvent::MessageChanged { kind, message } => {
                    assert_eq!(kind, ChangeKind::Insert);
                    assert_eq!(message, stored);
                    break;
                }
                TransportEvent::PresenceSync { .. } => continue,
            }
        }
    }
}
