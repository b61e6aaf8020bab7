//! Offer negotiation tests: proposing, answering and concurrent accepts

mod common;

use bazaar_chat::{
    Chat, ChatError, ChatSession, NotificationKind, OfferExtra, OfferStatus, Profile,
    SessionConfig, SessionNotice,
};
use bazaar_store::{Backend, Operation};
use common::*;
use std::time::Duration;

const OTHER_CHAT: &str = "chat-2";
const OTHER_BUYER: &str = "buyer-2";

fn extras() -> Vec<OfferExtra> {
    vec![OfferExtra::new("bikes", "Bike rack", 15.0)]
}

/// A second buyer negotiating over the same listing
fn add_other_buyer(backend: &Backend) {
    backend.repository.add_profile(Profile {
        id: OTHER_BUYER.to_string(),
        display_name: "Zeynep".to_string(),
    });
    backend.repository.add_chat(Chat {
        id: OTHER_CHAT.to_string(),
        buyer_id: OTHER_BUYER.to_string(),
        seller_id: SELLER.to_string(),
        listing_id: LISTING.to_string(),
    });
}

/// Sell the listing through chat-1
async fn sell_in_first_chat(backend: &Backend) {
    let (buyer, _buyer_notices) = open(backend, BUYER).await;
    let (seller, _seller_notices) = open(backend, SELLER).await;
    buyer.send_offer(2, vec![]).await.unwrap();
    let offer_id = wait_for_offer(&seller).await;
    seller.accept_offer(&offer_id).await.unwrap();
    buyer.close().await;
    seller.close().await;
}

#[tokio::test]
async fn test_buyer_sends_priced_offer() {
    let backend = backend();
    let (buyer, _notices) = open(&backend, BUYER).await;

    let sent = buyer.send_offer(3, extras()).await.unwrap();

    let offer = sent.offer.as_ref().unwrap();
    assert_eq!(offer.status, OfferStatus::Pending);
    assert!((offer.total_price - 155.0).abs() < 1e-9);
    assert!(sent.content.contains("Bike rack"));

    let notifications = backend.notifications.clone();
    eventually(|| notifications.count_of(NotificationKind::Offer) == 1).await;
    assert_eq!(backend.notifications.for_user(SELLER).len(), 1);
    buyer.close().await;
}

#[tokio::test]
async fn test_seller_cannot_propose() {
    let backend = backend();
    let (seller, _notices) = open(&backend, SELLER).await;

    let result = seller.send_offer(2, vec![]).await;
    assert!(matches!(result, Err(ChatError::NotPermitted(_))));
    assert_eq!(backend.repository.calls(Operation::InsertMessage), 0);
    seller.close().await;
}

#[tokio::test]
async fn test_invalid_offer_terms() {
    let backend = backend();
    let (buyer, _notices) = open(&backend, BUYER).await;

    let result = buyer.send_offer(0, vec![]).await;
    assert!(matches!(result, Err(ChatError::InvalidOffer(_))));

    let duplicated = vec![
        OfferExtra::new("bikes", "Bike rack", 15.0),
        OfferExtra::new("bikes", "Bike rack", 15.0),
    ];
    let result = buyer.send_offer(2, duplicated).await;
    assert!(matches!(result, Err(ChatError::InvalidOffer(_))));
    assert!(buyer.view().messages.is_empty());
    buyer.close().await;
}

#[tokio::test]
async fn test_seller_accepts_offer() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;
    let (seller, mut seller_notices) = open(&backend, SELLER).await;

    buyer.send_offer(2, vec![]).await.unwrap();
    let offer_id = wait_for_offer(&seller).await;

    let accepted = seller.accept_offer(&offer_id).await.unwrap();
    assert_eq!(accepted.offer_status(), Some(OfferStatus::Accepted));
    assert!(backend.repository.listing(LISTING).unwrap().sold);

    match seller_notices.recv().await {
        Some(SessionNotice::OfferSettled { message_id, status }) => {
            assert_eq!(message_id, offer_id);
            assert_eq!(status, OfferStatus::Accepted);
        }
        other => panic!("unexpected notice: {:?}", other),
    }

    // the buyer sees the status change, the sale and the announcement
    let view = wait_for_view(&buyer, |v| {
        v.message(&offer_id).and_then(|m| m.offer_status()) == Some(OfferStatus::Accepted)
            && v.listing.sold
            && v.messages.iter().any(|m| m.content.starts_with("Offer accepted"))
    })
    .await;
    assert_eq!(view.messages.len(), 2);

    let notifications = backend.notifications.clone();
    eventually(|| notifications.count_of(NotificationKind::OfferAccepted) == 1).await;
    let accepted_notice = backend
        .notifications
        .for_user(BUYER)
        .into_iter()
        .find(|n| n.kind == NotificationKind::OfferAccepted)
        .unwrap();
    assert!(accepted_notice.title.contains("Mehmet"));

    // no new offers once sold
    let result = buyer.send_offer(1, vec![]).await;
    assert!(matches!(result, Err(ChatError::AlreadySold(_))));

    buyer.close().await;
    seller.close().await;
}

#[tokio::test]
async fn test_concurrent_accepts_sell_once() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;
    // the seller has the chat open on two devices
    let (phone, mut phone_notices) = open(&backend, SELLER).await;
    let (laptop, mut laptop_notices) = open(&backend, SELLER).await;

    buyer.send_offer(2, extras()).await.unwrap();
    let offer_id = wait_for_offer(&phone).await;
    assert_eq!(wait_for_offer(&laptop).await, offer_id);

    backend
        .repository
        .set_write_delay(Some(Duration::from_millis(20)));
    let (first, second) = tokio::join!(phone.accept_offer(&offer_id), laptop.accept_offer(&offer_id));

    let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(is_already_sold(&first) || is_already_sold(&second));

    assert!(backend.repository.listing(LISTING).unwrap().sold);
    assert_eq!(
        backend.repository.message(&offer_id).unwrap().offer_status(),
        Some(OfferStatus::Accepted)
    );
    assert_eq!(backend.repository.calls(Operation::SetOfferStatus), 1);

    let loser_notices = if first.is_ok() {
        &mut laptop_notices
    } else {
        &mut phone_notices
    };
    assert!(matches!(
        loser_notices.recv().await,
        Some(SessionNotice::AlreadySold { .. })
    ));

    let notifications = backend.notifications.clone();
    eventually(|| notifications.count_of(NotificationKind::OfferAccepted) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        backend.notifications.count_of(NotificationKind::OfferAccepted),
        1
    );

    buyer.close().await;
    phone.close().await;
    laptop.close().await;
}

#[tokio::test]
async fn test_many_devices_accept_once() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;
    let mut devices = Vec::new();
    for _ in 0..4 {
        let (device, _notices) = open(&backend, SELLER).await;
        devices.push(device);
    }

    buyer.send_offer(5, extras()).await.unwrap();
    let offer_id = wait_for_offer(&buyer).await;
    for device in &devices {
        assert_eq!(wait_for_offer(device).await, offer_id);
    }

    backend
        .repository
        .set_write_delay(Some(Duration::from_millis(20)));
    let results =
        futures::future::join_all(devices.iter().map(|d| d.accept_offer(&offer_id))).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(results.iter().filter(|r| is_already_sold(r)).count(), 3);
    assert_eq!(backend.repository.calls(Operation::SetOfferStatus), 1);

    buyer.close().await;
    for device in &devices {
        device.close().await;
    }
}

#[tokio::test]
async fn test_competing_offers_sell_once() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;
    let (phone, _phone_notices) = open(&backend, SELLER).await;
    let (laptop, _laptop_notices) = open(&backend, SELLER).await;

    let short = buyer.send_offer(1, vec![]).await.unwrap();
    let long = buyer.send_offer(4, vec![]).await.unwrap();
    for session in [&phone, &laptop] {
        wait_for_view(session, |v| {
            v.message(&short.id).is_some() && v.message(&long.id).is_some()
        })
        .await;
    }

    backend
        .repository
        .set_write_delay(Some(Duration::from_millis(20)));
    let (first, second) = tokio::join!(phone.accept_offer(&short.id), laptop.accept_offer(&long.id));

    assert_eq!(
        [&first, &second].iter().filter(|r| r.is_ok()).count(),
        1
    );
    let accepted = [&short.id, &long.id]
        .iter()
        .filter(|id| {
            backend.repository.message(id).unwrap().offer_status() == Some(OfferStatus::Accepted)
        })
        .count();
    assert_eq!(accepted, 1);

    buyer.close().await;
    phone.close().await;
    laptop.close().await;
}

#[tokio::test]
async fn test_accepting_settled_offer_has_no_side_effects() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;
    let (seller, _seller_notices) = open(&backend, SELLER).await;

    buyer.send_offer(2, vec![]).await.unwrap();
    let offer_id = wait_for_offer(&seller).await;

    let rejected = seller.reject_offer(&offer_id).await.unwrap();
    assert_eq!(rejected.offer_status(), Some(OfferStatus::Rejected));

    let result = seller.accept_offer(&offer_id).await;
    assert!(matches!(
        result,
        Err(ChatError::OfferNotPending(OfferStatus::Rejected))
    ));
    assert_eq!(backend.repository.calls(Operation::SetListingSold), 0);
    assert!(!backend.repository.listing(LISTING).unwrap().sold);

    let notifications = backend.notifications.clone();
    eventually(|| notifications.count_of(NotificationKind::OfferRejected) == 1).await;

    buyer.close().await;
    seller.close().await;
}

#[tokio::test]
async fn test_only_recipient_may_answer() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;

    let sent = buyer.send_offer(2, vec![]).await.unwrap();
    wait_for_view(&buyer, |v| v.message(&sent.id).is_some()).await;

    let result = buyer.accept_offer(&sent.id).await;
    assert!(matches!(result, Err(ChatError::NotPermitted(_))));
    let result = buyer.accept_offer("missing").await;
    assert!(matches!(result, Err(ChatError::MessageNotFound(_))));
    assert_eq!(backend.repository.calls(Operation::SetListingSold), 0);

    buyer.close().await;
}

#[tokio::test]
async fn test_plain_message_cannot_be_accepted() {
    let backend = backend();
    let seeded = seed_text(&backend, BUYER, "Merhaba");
    let (seller, _notices) = open(&backend, SELLER).await;

    let result = seller.accept_offer(&seeded.id).await;
    assert!(matches!(result, Err(ChatError::NotAnOffer(_))));
    seller.close().await;
}

#[tokio::test]
async fn test_failed_status_write_releases_listing() {
    let backend = backend();
    let (buyer, _buyer_notices) = open(&backend, BUYER).await;
    let (seller, _seller_notices) = open(&backend, SELLER).await;

    buyer.send_offer(2, vec![]).await.unwrap();
    let offer_id = wait_for_offer(&seller).await;

    backend.repository.fail_next(Operation::SetOfferStatus, 1);
    let result = seller.accept_offer(&offer_id).await;
    assert!(matches!(result, Err(ChatError::OfferWriteFailed(_))));
    assert!(!backend.repository.listing(LISTING).unwrap().sold);
    assert_eq!(
        backend.repository.message(&offer_id).unwrap().offer_status(),
        Some(OfferStatus::Pending)
    );
    assert!(!seller.view().listing.sold);

    // the offer can still be accepted afterwards
    seller.accept_offer(&offer_id).await.unwrap();
    assert!(backend.repository.listing(LISTING).unwrap().sold);

    buyer.close().await;
    seller.close().await;
}

#[tokio::test]
async fn test_sale_in_another_chat_reaches_open_session() {
    let backend = backend();
    add_other_buyer(&backend);
    let (other, _other_notices) =
        ChatSession::open(OTHER_CHAT, OTHER_BUYER, backend.deps(), config())
            .await
            .unwrap();
    assert!(!other.view().listing.sold);

    sell_in_first_chat(&backend).await;

    // picked up by the next poll cycle
    let view = wait_for_view(&other, |v| v.listing.sold).await;
    assert!(view.messages.is_empty());

    let inserts = backend.repository.calls(Operation::InsertMessage);
    let result = other.send_offer(2, vec![]).await;
    assert!(matches!(result, Err(ChatError::AlreadySold(id)) if id == LISTING));
    assert_eq!(backend.repository.calls(Operation::InsertMessage), inserts);

    other.close().await;
}

#[tokio::test]
async fn test_offer_refused_by_store_reports_already_sold() {
    let backend = backend();
    add_other_buyer(&backend);
    let slow_polls = SessionConfig {
        poll_interval_seconds: 3600,
        ..config()
    };
    let (other, mut other_notices) =
        ChatSession::open(OTHER_CHAT, OTHER_BUYER, backend.deps(), slow_polls)
            .await
            .unwrap();

    sell_in_first_chat(&backend).await;
    // no poll has run yet, so the session still shows the listing as available
    assert!(!other.view().listing.sold);

    let result = other.send_offer(3, extras()).await;
    assert!(matches!(result, Err(ChatError::AlreadySold(id)) if id == LISTING));

    let view = other.view();
    assert!(view.listing.sold);
    assert_eq!(view.pending_count(), 0);
    assert!(view.messages.is_empty());
    assert!(matches!(
        other_notices.recv().await,
        Some(SessionNotice::SendFailed { text: None, .. })
    ));

    other.close().await;
}
