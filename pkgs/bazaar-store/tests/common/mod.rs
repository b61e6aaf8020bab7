//! Shared setup for session tests

#![allow(dead_code)]

use bazaar_chat::{
    Chat, ChatError, ChatSession, Listing, Message, NewMessage, Profile, SessionConfig,
    SessionNotice, SessionView,
};
use bazaar_store::Backend;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const CHAT: &str = "chat-1";
pub const BUYER: &str = "buyer-1";
pub const SELLER: &str = "seller-1";
pub const LISTING: &str = "listing-1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Backend with one chat between Ayşe (buyer) and Mehmet (seller)
pub fn backend() -> Backend {
    init_tracing();
    let backend = Backend::new();
    backend.repository.add_profile(Profile {
        id: BUYER.to_string(),
        display_name: "Ayşe".to_string(),
    });
    backend.repository.add_profile(Profile {
        id: SELLER.to_string(),
        display_name: "Mehmet".to_string(),
    });
    backend.repository.add_listing(Listing {
        id: LISTING.to_string(),
        seller_id: SELLER.to_string(),
        title: "Camping van".to_string(),
        base_price: 100.0,
        daily_surcharge: 20.0,
        sold: false,
    });
    backend.repository.add_chat(Chat {
        id: CHAT.to_string(),
        buyer_id: BUYER.to_string(),
        seller_id: SELLER.to_string(),
        listing_id: LISTING.to_string(),
    });
    backend
}

pub fn config() -> SessionConfig {
    SessionConfig {
        poll_interval_seconds: 1,
        typing_idle_millis: 2000,
        resubscribe_initial_backoff_millis: 50,
        resubscribe_max_backoff_millis: 200,
        ..SessionConfig::default()
    }
}

pub async fn open(
    backend: &Backend,
    user_id: &str,
) -> (ChatSession, UnboundedReceiver<SessionNotice>) {
    open_with(backend, user_id, config()).await
}

pub async fn open_with(
    backend: &Backend,
    user_id: &str,
    config: SessionConfig,
) -> (ChatSession, UnboundedReceiver<SessionNotice>) {
    ChatSession::open(CHAT, user_id, backend.deps(), config)
        .await
        .expect("Failed to open session")
}

/// Store a message without going through a session or the hub
pub fn seed_text(backend: &Backend, sender_id: &str, content: &str) -> Message {
    backend.repository.seed_message(NewMessage {
        chat_id: CHAT.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        offer: None,
    })
}

/// Wait until the session view satisfies `predicate`
pub async fn wait_for_view(
    session: &ChatSession,
    predicate: impl Fn(&SessionView) -> bool,
) -> SessionView {
    let mut view = session.watch();
    tokio::time::timeout(Duration::from_secs(30), async {
        let matched = view
            .wait_for(|v| predicate(v))
            .await
            .expect("Session loop stopped");
        (*matched).clone()
    })
    .await
    .expect("Timed out waiting for session view")
}

/// Poll `check` until it holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached");
}

/// Id of the first offer message visible to `session`
pub async fn wait_for_offer(session: &ChatSession) -> String {
    let view = wait_for_view(session, |v| {
        v.messages.iter().any(|m| m.offer.is_some() && !m.pending)
    })
    .await;
    view.messages
        .iter()
        .find(|m| m.offer.is_some() && !m.pending)
        .map(|m| m.id.clone())
        .expect("offer message")
}

pub fn is_already_sold(result: &Result<Message, ChatError>) -> bool {
    matches!(result, Err(ChatError::AlreadySold(_)))
}
