//! Polling reconciler
//!
//! Push delivery is best-effort; the reconciler is the correctness backstop.
//! On a fixed interval it re-fetches the full message list and feeds it through
//! the same merge as realtime events. The listing is re-read in the same cycle,
//! since it can be sold from another chat.
//!
//! A cycle is skipped while an optimistic send is in flight, and a result is
//! discarded if a send started or finished while the fetch was outstanding, so
//! a stale snapshot never interleaves with a write that has not round-tripped.
//! At most one poll is in flight at a time. A listing read is likewise dropped
//! if the session changed its listing copy while the read was outstanding.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::RepositoryError;
use crate::model::{Listing, Message};
use crate::repository::ChatRepository;

/// Bookkeeping deciding whether a poll may start and whether its result is fresh
#[derive(Debug, Default)]
pub struct PollGate {
    poll_in_flight: bool,
    sends_in_flight: usize,
    send_epoch: u64,
    listing_epoch: u64,
}

impl PollGate {
    pub fn send_started(&mut self) {
        self.sends_in_flight += 1;
        self.send_epoch += 1;
    }

    pub fn send_finished(&mut self) {
        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
        self.send_epoch += 1;
    }

    pub fn sends_in_flight(&self) -> usize {
        self.sends_in_flight
    }

    /// The session changed its listing copy on its own
    pub fn listing_changed(&mut self) {
        self.listing_epoch += 1;
    }

    /// Start a poll, returning the ticket to hand back to [`finish_poll`](Self::finish_poll)
    pub fn try_begin_poll(&mut self) -> Option<PollTicket> {
        if self.poll_in_flight || self.sends_in_flight > 0 {
            return None;
        }
        self.poll_in_flight = true;
        Some(PollTicket {
            send_epoch: self.send_epoch,
            listing_epoch: self.listing_epoch,
        })
    }

    /// Finish a poll; `true` if its messages may be applied
    pub fn finish_poll(&mut self, ticket: PollTicket) -> bool {
        self.poll_in_flight = false;
        self.sends_in_flight == 0 && ticket.send_epoch == self.send_epoch
    }

    /// Whether a listing read under `ticket` is still current
    pub fn listing_is_fresh(&self, ticket: PollTicket) -> bool {
        ticket.listing_epoch == self.listing_epoch
    }
}

/// Gate state captured when a poll starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket {
    send_epoch: u64,
    listing_epoch: u64,
}

/// Result of one poll cycle
#[derive(Debug)]
pub struct PollResult {
    pub ticket: PollTicket,
    pub messages: Result<Vec<Message>, RepositoryError>,
    pub listing: Result<Listing, RepositoryError>,
}

/// Poll timer plus gate, owned by the session loop
pub struct Reconciler {
    interval: Interval,
    gate: PollGate,
}

impl Reconciler {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            gate: PollGate::default(),
        }
    }

    /// Resolves when the next cycle is due
    pub async fn due(&mut self) {
        self.interval.tick().await;
    }

    pub fn gate(&self) -> &PollGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut PollGate {
        &mut self.gate
    }

    /// Start a fetch if the gate allows it; the result is sent to `results`.
    /// Returns `false` when the cycle was skipped.
    pub fn start_poll(
        &mut self,
        repository: Arc<dyn ChatRepository>,
        chat_id: String,
        listing_id: String,
        results: mpsc::UnboundedSender<PollResult>,
    ) -> bool {
        let Some(ticket) = self.gate.try_begin_poll() else {
            return false;
        };

        tokio::spawn(async move {
            let (messages, listing) = tokio::join!(
                repository.list_messages(&chat_id),
                repository.get_listing(&listing_id)
            );
            let _ = results.send(PollResult {
                ticket,
                messages,
                listing,
            });
        });
        true
    }
}
