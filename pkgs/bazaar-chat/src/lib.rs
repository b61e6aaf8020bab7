//! Bazaar Chat - Buyer/seller negotiation sessions over a listing
//!
//! This crate holds the client-side core of a listing negotiation chat:
//! loading a chat, keeping its message list consistent while messages arrive
//! from several sources, and driving price offers to a terminal state.
//!
//! # Architecture
//!
//! - **ChatSession**: the handle the presentation layer talks to; one event
//!   loop task per open session owns all of its state
//! - **RealtimeAdapter**: keeps the chat channel subscribed, resubscribes with
//!   backoff after drops and publishes the typing indicator
//! - **Reconciler**: periodic full fetch that catches up on whatever realtime
//!   delivery missed, skipped while local sends are in flight
//! - **Merge**: idempotent, order-independent merge of messages by id
//! - **Offers**: `pending → accepted | rejected`, with the listing sold through
//!   a conditional write so that concurrent accepts cannot both win
//!
//! The persisted store, the realtime transport and notification delivery are
//! external collaborators behind the [`ChatRepository`], [`Transport`] and
//! [`Notifier`] traits.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use bazaar_chat::{ChatSession, SessionConfig, SessionDeps};
//!
//! # async fn example(deps: SessionDeps) -> Result<(), bazaar_chat::ChatError> {
//! let (session, _notices) =
//!     ChatSession::open("chat-1", "buyer-1", deps, SessionConfig::default()).await?;
//!
//! session.input_changed("Merhaba")?;
//! let sent = session.send_message("Merhaba").await?;
//! println!("Sent {}", sent.id);
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod merge;
pub mod model;
pub mod notify;
pub mod offer;
pub mod presence;
pub mod realtime;
pub mod receipts;
pub mod reconciler;
pub mod repository;
mod send;
pub mod session;
pub mod transport;

pub use config::SessionConfig;
pub use error::{ChatError, RepositoryError, TransportError};
pub use merge::{merge_all, merge_message, MergeOutcome, MergeSummary};
pub use model::{
    Chat, Listing, Message, NewMessage, Offer, OfferExtra, OfferStatus, ParticipantRole, Profile,
    LOCAL_ID_PREFIX,
};
pub use notify::{Notification, NotificationKind, Notifier};
pub use repository::{ChatRepository, ConditionalWrite};
pub use session::{ChatSession, SessionDeps, SessionNotice, SessionView};
pub use transport::{ChangeKind, ChannelHandle, Transport, TransportEvent};
