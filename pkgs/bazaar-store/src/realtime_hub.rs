//! In-process realtime hub
//!
//! Fans message change events out to every subscriber of a chat channel and
//! keeps the per-channel presence roster. Subscriptions can be dropped on
//! purpose and delivery can be muted, so the recovery paths of a session can be
//! driven without a network.

use async_trait::async_trait;
use bazaar_chat::{ChannelHandle, Transport, TransportError, TransportEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Presence publications kept for inspection; older records are dropped
pub const PRESENCE_LOG_CAPACITY: usize = 1024;

/// One presence publication as seen by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub chat_id: String,
    pub participant_id: String,
    pub typing: bool,
    pub at: Instant,
}

struct Subscriber {
    id: u64,
    participant_id: String,
    typing: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, Vec<Subscriber>>,
    next_subscriber: u64,
    failing_subscribes: usize,
    muted: bool,
    presence_log: VecDeque<PresenceRecord>,
}

impl HubState {
    fn roster(&self, chat_id: &str) -> HashMap<String, bool> {
        let mut roster = HashMap::new();
        for subscriber in self.channels.get(chat_id).into_iter().flatten() {
            let typing = roster.entry(subscriber.participant_id.clone()).or_insert(false);
            *typing |= subscriber.typing;
        }
        roster
    }

    fn broadcast(&mut self, chat_id: &str, event: TransportEvent) {
        if let Some(subscribers) = self.channels.get_mut(chat_id) {
            subscribers.retain(|s| s.events.send(event.clone()).is_ok());
        }
    }

    fn sync_presence(&mut self, chat_id: &str) {
        let typing = self.roster(chat_id);
        self.broadcast(chat_id, TransportEvent::PresenceSync { typing });
    }
}

/// Per-chat broadcast channels with presence
#[derive(Clone, Default)]
pub struct RealtimeHub {
    state: Arc<Mutex<HubState>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to everyone subscribed to `chat_id`, unless muted
    pub fn publish(&self, chat_id: &str, event: TransportEvent) {
        let mut state = self.state.lock();
        if state.muted {
            debug!("Hub muted, dropping event for {}", chat_id);
            return;
        }
        state.broadcast(chat_id, event);
    }

    /// Stop (or resume) delivering message events; presence is unaffected
    pub fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    /// Make the next `count` subscribe attempts fail
    pub fn fail_next_subscribes(&self, count: usize) {
        self.state.lock().failing_subscribes = count;
    }

    /// Cut every subscription of `chat_id`, as a network drop would
    pub fn drop_subscriptions(&self, chat_id: &str) -> usize {
        let dropped = self
            .state
            .lock()
            .channels
            .remove(chat_id)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0);
        info!("Dropped {} subscriptions of {}", dropped, chat_id);
        dropped
    }

    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(chat_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Current typing state of every participant on the channel
    pub fn roster(&self, chat_id: &str) -> HashMap<String, bool> {
        self.state.lock().roster(chat_id)
    }

    /// Typing publications of `participant_id` on `chat_id`, oldest first.
    /// Only the last [`PRESENCE_LOG_CAPACITY`] publications of the hub are kept.
    pub fn presence_history(&self, chat_id: &str, participant_id: &str) -> Vec<PresenceRecord> {
        self.state
            .lock()
            .presence_log
            .iter()
            .filter(|r| r.chat_id == chat_id && r.participant_id == participant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for RealtimeHub {
    async fn subscribe(
        &self,
        chat_id: &str,
        participant_id: &str,
    ) -> Result<(Box<dyn ChannelHandle>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
    {
        let mut state = self.state.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(TransportError::SubscribeFailed(format!(
                "hub refused {} on {}",
                participant_id, chat_id
            )));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state
            .channels
            .entry(chat_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                participant_id: participant_id.to_string(),
                typing: false,
                events,
            });
        state.sync_presence(chat_id);
        debug!("{} joined {} as subscriber {}", participant_id, chat_id, id);

        let handle = HubChannel {
            state: self.state.clone(),
            chat_id: chat_id.to_string(),
            participant_id: participant_id.to_string(),
            subscriber_id: id,
        };
        Ok((Box::new(handle), receiver))
    }
}

/// One subscription to a hub channel
struct HubChannel {
    state: Arc<Mutex<HubState>>,
    chat_id: String,
    participant_id: String,
    subscriber_id: u64,
}

#[async_trait]
impl ChannelHandle for HubChannel {
    async fn track(&self, typing: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let subscriber = state
            .channels
            .get_mut(&self.chat_id)
            .and_then(|subscribers| subscribers.iter_mut().find(|s| s.id == self.subscriber_id))
            .ok_or_else(|| TransportError::ChannelClosed(self.chat_id.clone()))?;
        subscriber.typing = typing;

        if state.presence_log.len() == PRESENCE_LOG_CAPACITY {
            state.presence_log.pop_front();
        }
        state.presence_log.push_back(PresenceRecord {
            chat_id: self.chat_id.clone(),
            participant_id: self.participant_id.clone(),
            typing,
            at: Instant::now(),
        });
        state.sync_presence(&self.chat_id);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.channels.get_mut(&self.chat_id) {
            subscribers.retain(|s| s.id != self.subscriber_id);
        }
        state.sync_presence(&self.chat_id);
        debug!("{} left {}", self.participant_id, self.chat_id);
    }
}
