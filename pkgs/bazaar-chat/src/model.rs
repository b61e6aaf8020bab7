//! Chat, message and offer value types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::ChatError;

/// Prefix of ids given to messages that have not reached the repository yet
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Tolerance used when comparing prices
const PRICE_EPSILON: f64 = 0.005;

/// A negotiation between a buyer and a seller over one listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub listing_id: String,
}

/// Side of the negotiation a user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    Buyer,
    Seller,
}

impl Chat {
    pub fn role_of(&self, user_id: &str) -> Option<ParticipantRole> {
        if user_id == self.buyer_id {
            Some(ParticipantRole::Buyer)
        } else if user_id == self.seller_id {
            Some(ParticipantRole::Seller)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.role_of(user_id).is_some()
    }

    /// The other participant, or `None` when `user_id` is not part of the chat
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        match self.role_of(user_id)? {
            ParticipantRole::Buyer => Some(&self.seller_id),
            ParticipantRole::Seller => Some(&self.buyer_id),
        }
    }
}

/// Public profile of a participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub display_name: String,
}

/// The listing a chat negotiates over
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub seller_id: String,
    pub title: String,
    /// Price covering the first day
    pub base_price: f64,
    /// Added for every day after the first
    pub daily_surcharge: f64,
    pub sold: bool,
}

impl Listing {
    /// Surcharge for a proposal lasting `duration_days`
    pub fn duration_surcharge(&self, duration_days: u32) -> f64 {
        self.daily_surcharge * f64::from(duration_days.saturating_sub(1))
    }
}

/// Offer lifecycle state. `Accepted` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
}

impl OfferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OfferStatus::Pending)
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Optional add-on priced into an offer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferExtra {
    pub id: String,
    pub label: String,
    pub price: f64,
}

impl OfferExtra {
    pub fn new(id: impl Into<String>, label: impl Into<String>, price: f64) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            price,
        }
    }
}

/// Structured price proposal embedded in a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub duration_days: u32,
    pub extras: Vec<OfferExtra>,
    pub total_price: f64,
    pub status: OfferStatus,
}

impl Offer {
    /// Build a pending offer for `listing`, pricing it from the listing's base
    /// price, the duration surcharge and the extras.
    pub fn compose(
        listing: &Listing,
        duration_days: u32,
        extras: Vec<OfferExtra>,
    ) -> Result<Self, ChatError> {
        if duration_days < 1 {
            return Err(ChatError::InvalidOffer(
                "duration must be at least one day".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for extra in &extras {
            if !seen.insert(extra.id.as_str()) {
                return Err(ChatError::InvalidOffer(format!(
                    "duplicate extra id: {}",
                    extra.id
                )));
            }
            if !extra.price.is_finite() || extra.price < 0.0 {
                return Err(ChatError::InvalidOffer(format!(
                    "extra {} has invalid price {}",
                    extra.id, extra.price
                )));
            }
        }

        let total_price = Self::quote(listing, duration_days, &extras);
        Ok(Self {
            duration_days,
            extras,
            total_price,
            status: OfferStatus::Pending,
        })
    }

    /// Total price for the given terms
    pub fn quote(listing: &Listing, duration_days: u32, extras: &[OfferExtra]) -> f64 {
        let extras_total: f64 = extras.iter().map(|e| e.price).sum();
        listing.base_price + listing.duration_surcharge(duration_days) + extras_total
    }

    /// Whether `total_price` still matches what the listing would charge
    pub fn is_consistent_with(&self, listing: &Listing) -> bool {
        let expected = Self::quote(listing, self.duration_days, &self.extras);
        (expected - self.total_price).abs() < PRICE_EPSILON
    }

    pub fn with_status(&self, status: OfferStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Human readable one-liner used as the content of an offer message
    pub fn summary(&self) -> String {
        let days = if self.duration_days == 1 { "day" } else { "days" };
        if self.extras.is_empty() {
            format!(
                "Offer: {} {} for {:.2}",
                self.duration_days, days, self.total_price
            )
        } else {
            let labels: Vec<&str> = self.extras.iter().map(|e| e.label.as_str()).collect();
            format!(
                "Offer: {} {} with {} for {:.2}",
                self.duration_days,
                days,
                labels.join(", "),
                self.total_price
            )
        }
    }
}

/// A chat message, as stored by the repository or synthesized locally
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Offer>,

    /// Set only on local optimistic messages awaiting acknowledgment
    #[serde(skip)]
    pub pending: bool,
}

impl Message {
    /// Synthesize a local optimistic message with a temporary id
    pub fn local(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        offer: Option<Offer>,
    ) -> Self {
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            read_at: None,
            offer,
            pending: true,
        }
    }

    /// Whether this message exists only locally
    pub fn is_local(&self) -> bool {
        self.pending || self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// Whether `other` carries the same submission: sender, text and offer terms.
    /// Ids, timestamps and offer status are not compared.
    pub fn same_submission(&self, other: &Message) -> bool {
        self.chat_id == other.chat_id
            && self.sender_id == other.sender_id
            && self.content == other.content
            && match (&self.offer, &other.offer) {
                (None, None) => true,
                (Some(a), Some(b)) => {
                    a.duration_days == b.duration_days
                        && a.extras == b.extras
                        && (a.total_price - b.total_price).abs() < PRICE_EPSILON
                }
                _ => false,
            }
    }

    /// Unread from the point of view of `user_id`
    pub fn is_unread_for(&self, user_id: &str) -> bool {
        self.sender_id != user_id && self.read_at.is_none() && !self.is_local()
    }

    pub fn offer_status(&self) -> Option<OfferStatus> {
        self.offer.as_ref().map(|o| o.status)
    }
}

/// Insert request for the repository; the server assigns id and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Offer>,
}

impl From<&Message> for NewMessage {
    fn from(message: &Message) -> Self {
        Self {
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            offer: message.offer.clone(),
        }
    }
}
