//! Realtime transport contract
//!
//! A transport delivers change events for one chat channel and carries
//! presence in both directions. Subscribing yields a handle for outbound
//! presence plus a receiver of inbound [`TransportEvent`]s; the receiver
//! yielding `None` means the subscription dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::model::Message;

/// Table operation a message event was raised for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Inbound realtime event
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A row of the messages table changed
    MessageChanged { kind: ChangeKind, message: Message },
    /// Current typing state of every participant on the channel
    PresenceSync { typing: HashMap<String, bool> },
}

/// Outbound side of a channel subscription
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Publish this participant's typing state
    async fn track(&self, typing: bool) -> Result<(), TransportError>;

    /// Leave the channel; presence of this participant is dropped
    async fn close(&self);
}

/// Subscription factory for per-chat channels
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        chat_id: &str,
        participant_id: &str,
    ) -> Result<(Box<dyn ChannelHandle>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>;
}
