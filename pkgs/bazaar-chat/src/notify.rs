//! Notifications addressed to the counterpart
//!
//! Delivery is fire-and-forget: failures are logged and never reach the user
//! whose action triggered the notification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RepositoryError;
use crate::model::Offer;

/// Longest message preview carried in a notification body
const PREVIEW_CHARS: usize = 80;

/// Notification type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Offer,
    OfferAccepted,
    OfferRejected,
}

/// Notification create request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub link: String,
}

impl Notification {
    pub fn message(recipient: &str, sender_name: &str, content: &str, link: String) -> Self {
        Self {
            user_id: recipient.to_string(),
            kind: NotificationKind::Message,
            title: format!("New message from {}", sender_name),
            body: preview(content),
            link,
        }
    }

    pub fn offer(recipient: &str, sender_name: &str, offer: &Offer, link: String) -> Self {
        Self {
            user_id: recipient.to_string(),
            kind: NotificationKind::Offer,
            title: format!("New offer from {}", sender_name),
            body: offer.summary(),
            link,
        }
    }

    pub fn offer_accepted(recipient: &str, actor_name: &str, offer: &Offer, link: String) -> Self {
        Self {
            user_id: recipient.to_string(),
            kind: NotificationKind::OfferAccepted,
            title: format!("{} accepted your offer", actor_name),
            body: format!("Agreed price: {:.2}", offer.total_price),
            link,
        }
    }

    pub fn offer_rejected(recipient: &str, actor_name: &str, offer: &Offer, link: String) -> Self {
        Self {
            user_id: recipient.to_string(),
            kind: NotificationKind::OfferRejected,
            title: format!("{} declined your offer", actor_name),
            body: offer.summary(),
            link,
        }
    }
}

/// Notification collaborator
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), RepositoryError>;
}

/// Deliver in the background; the caller never waits for or sees the outcome
pub(crate) fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let user_id = notification.user_id.clone();
        let kind = notification.kind;
        match notifier.notify(notification).await {
            Ok(()) => debug!("Notified {} ({:?})", user_id, kind),
            Err(e) => warn!("Failed to notify {} ({:?}): {}", user_id, kind, e),
        }
    });
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
