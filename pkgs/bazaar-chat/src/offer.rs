//! Offer negotiation state machine
//!
//! ```text
//! pending ──accept──▶ accepted
//!    └─────reject──▶ rejected
//! ```
//!
//! Only the participant who did not send the offer may answer it, and only
//! while it is pending.
//!
//! Accepting sells the listing. Both negotiation parties (or two devices of the
//! same party) can race here, so the listing flag is flipped with a single
//! conditional write and the offer is marked accepted only after that write
//! applied. If marking the offer fails the listing write is compensated.

use tracing::{error, info, instrument, warn};

use crate::error::ChatError;
use crate::model::{Chat, Message, NewMessage, Offer, OfferStatus};
use crate::repository::ChatRepository;

/// Outcome of a successful accept
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedOffer {
    /// The offer message with its status set to accepted
    pub offer_message: Message,
    /// System message announcing the price, if it could be written
    pub announcement: Option<Message>,
}

/// Check that `actor_id` may move the offer in `message` out of pending
pub fn authorize_answer<'a>(
    chat: &Chat,
    message: &'a Message,
    actor_id: &str,
) -> Result<&'a Offer, ChatError> {
    let offer = message
        .offer
        .as_ref()
        .ok_or_else(|| ChatError::NotAnOffer(message.id.clone()))?;

    if offer.status.is_terminal() {
        return Err(ChatError::OfferNotPending(offer.status));
    }
    if message.is_local() {
        return Err(ChatError::NotPermitted(
            "offer has not been delivered yet".to_string(),
        ));
    }
    if !chat.is_participant(actor_id) {
        return Err(ChatError::Unauthorized {
            chat_id: chat.id.clone(),
            user_id: actor_id.to_string(),
        });
    }
    if message.sender_id == actor_id {
        return Err(ChatError::NotPermitted(
            "only the recipient can answer an offer".to_string(),
        ));
    }
    Ok(offer)
}

/// Content of the system message appended after an accept
pub fn announcement_text(offer: &Offer) -> String {
    format!(
        "Offer accepted: {:.2} for {} day(s)",
        offer.total_price, offer.duration_days
    )
}

/// Accept a pending offer and sell the listing
#[instrument(skip(repository, chat, message), fields(chat_id = %chat.id, message_id = %message.id))]
pub async fn accept(
    repository: &dyn ChatRepository,
    chat: &Chat,
    message: &Message,
    actor_id: &str,
) -> Result<AcceptedOffer, ChatError> {
    let offer = authorize_answer(chat, message, actor_id)?.clone();

    let listing = repository
        .get_listing(&chat.listing_id)
        .await
        .map_err(ChatError::OfferWriteFailed)?;
    if listing.sold {
        info!("Listing {} already sold, offer stays pending", listing.id);
        return Err(ChatError::AlreadySold(listing.id));
    }

    let write = repository
        .set_listing_sold(&chat.listing_id, true, false)
        .await
        .map_err(ChatError::OfferWriteFailed)?;
    if !write.applied {
        info!("Lost the race to sell listing {}", chat.listing_id);
        return Err(ChatError::AlreadySold(chat.listing_id.clone()));
    }

    if let Err(e) = repository
        .set_offer_status(&message.id, OfferStatus::Accepted)
        .await
    {
        error!("Failed to mark offer {} accepted: {}", message.id, e);
        release_listing(repository, &chat.listing_id).await;
        return Err(ChatError::OfferWriteFailed(e));
    }

    let mut offer_message = message.clone();
    offer_message.offer = Some(offer.with_status(OfferStatus::Accepted));

    let announcement = match repository
        .insert_message(NewMessage {
            chat_id: chat.id.clone(),
            sender_id: actor_id.to_string(),
            content: announcement_text(&offer),
            offer: None,
        })
        .await
    {
        Ok(announcement) => Some(announcement),
        Err(e) => {
            warn!("Offer {} accepted but announcement failed: {}", message.id, e);
            None
        }
    };

    info!(
        "Offer {} accepted at {:.2}, listing {} sold",
        message.id, offer.total_price, chat.listing_id
    );
    Ok(AcceptedOffer {
        offer_message,
        announcement,
    })
}

/// Reject a pending offer
#[instrument(skip(repository, chat, message), fields(chat_id = %chat.id, message_id = %message.id))]
pub async fn reject(
    repository: &dyn ChatRepository,
    chat: &Chat,
    message: &Message,
    actor_id: &str,
) -> Result<Message, ChatError> {
    let offer = authorize_answer(chat, message, actor_id)?.clone();

    repository
        .set_offer_status(&message.id, OfferStatus::Rejected)
        .await
        .map_err(ChatError::OfferWriteFailed)?;

    let mut offer_message = message.clone();
    offer_message.offer = Some(offer.with_status(OfferStatus::Rejected));
    info!("Offer {} rejected", message.id);
    Ok(offer_message)
}

async fn release_listing(repository: &dyn ChatRepository, listing_id: &str) {
    match repository.set_listing_sold(listing_id, false, true).await {
        Ok(write) if write.applied => warn!("Released listing {} after failed accept", listing_id),
        Ok(_) => error!(
            "Listing {} changed before it could be released after a failed accept",
            listing_id
        ),
        Err(e) => error!("Failed to release listing {}: {}", listing_id, e),
    }
}
