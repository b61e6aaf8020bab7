//! Session event loop
//!
//! One task owns all per-chat state. User commands, realtime events, poll
//! results and write acknowledgments all arrive over channels and are applied
//! here one at a time, so the message list needs no locking. Repository I/O
//! runs in spawned tasks that report back; once the loop stops their results
//! have nowhere to go and are discarded.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::view::{SessionNotice, SessionView};
use crate::config::SessionConfig;
use crate::error::{ChatError, RepositoryError};
use crate::merge::{self, MergeOutcome};
use crate::model::{Chat, Listing, Message, Offer, OfferExtra, OfferStatus, ParticipantRole, Profile};
use crate::notify::{self, Notification, Notifier};
use crate::offer::{self, AcceptedOffer};
use crate::presence::{self, TypingDebouncer};
use crate::realtime::RealtimeAdapter;
use crate::receipts;
use crate::reconciler::{PollResult, PollTicket, Reconciler};
use crate::repository::ChatRepository;
use crate::send::{self, OptimisticSends, SendAck, SendCompletion, SendReply};
use crate::transport::TransportEvent;

pub(crate) type AnswerReply = oneshot::Sender<Result<Message, ChatError>>;

/// Which way an offer is being answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferDecision {
    Accept,
    Reject,
}

/// Requests from the [`ChatSession`](super::ChatSession) handle
pub(crate) enum Command {
    SendMessage {
        text: String,
        reply: SendReply,
    },
    SendOffer {
        duration_days: u32,
        extras: Vec<OfferExtra>,
        reply: SendReply,
    },
    AnswerOffer {
        message_id: String,
        decision: OfferDecision,
        reply: AnswerReply,
    },
    InputChanged {
        text: String,
    },
    MarkRead {
        reply: oneshot::Sender<usize>,
    },
}

enum Settlement {
    Accepted(AcceptedOffer),
    Rejected(Message),
}

struct OfferResult {
    message_id: String,
    result: Result<Settlement, ChatError>,
}

struct ReadAck {
    ids: Vec<String>,
    stamped_at: chrono::DateTime<Utc>,
    result: Result<(), RepositoryError>,
}

/// Everything the loop needs, gathered by `ChatSession::open`
pub(crate) struct LoopParts {
    pub chat: Chat,
    pub user_id: String,
    pub user_name: String,
    pub counterpart: Profile,
    pub listing: Listing,
    pub history: Vec<Message>,
    pub repository: Arc<dyn ChatRepository>,
    pub notifier: Arc<dyn Notifier>,
    pub adapter: RealtimeAdapter,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub notices: mpsc::UnboundedSender<SessionNotice>,
    pub cancel: CancellationToken,
    pub config: SessionConfig,
}

pub(crate) struct SessionLoop {
    chat: Chat,
    user_id: String,
    user_name: String,
    counterpart: Profile,
    listing: Listing,
    config: SessionConfig,

    messages: Vec<Message>,
    draft: String,
    counterpart_typing: bool,

    repository: Arc<dyn ChatRepository>,
    notifier: Arc<dyn Notifier>,

    typing: TypingDebouncer,
    adapter: RealtimeAdapter,
    reconciler: Reconciler,
    sends: OptimisticSends,
    answering: HashMap<String, AnswerReply>,

    commands: mpsc::UnboundedReceiver<Command>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    send_acks_tx: mpsc::UnboundedSender<SendAck>,
    send_acks: mpsc::UnboundedReceiver<SendAck>,
    poll_results_tx: mpsc::UnboundedSender<PollResult>,
    poll_results: mpsc::UnboundedReceiver<PollResult>,
    offer_results_tx: mpsc::UnboundedSender<OfferResult>,
    offer_results: mpsc::UnboundedReceiver<OfferResult>,
    read_acks_tx: mpsc::UnboundedSender<ReadAck>,
    read_acks: mpsc::UnboundedReceiver<ReadAck>,

    view: watch::Sender<SessionView>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    cancel: CancellationToken,
}

impl SessionLoop {
    /// Build the loop and the receiver its views are published to
    pub fn new(parts: LoopParts) -> (Self, watch::Receiver<SessionView>) {
        let (send_acks_tx, send_acks) = mpsc::unbounded_channel();
        let (poll_results_tx, poll_results) = mpsc::unbounded_channel();
        let (offer_results_tx, offer_results) = mpsc::unbounded_channel();
        let (read_acks_tx, read_acks) = mpsc::unbounded_channel();

        let mut messages = Vec::with_capacity(parts.history.len());
        merge::merge_all(&mut messages, parts.history);

        let (view, view_rx) = watch::channel(SessionView {
            chat: parts.chat.clone(),
            counterpart: parts.counterpart.clone(),
            listing: parts.listing.clone(),
            messages: messages.clone(),
            draft: String::new(),
            counterpart_typing: false,
            closed: false,
        });

        let session_loop = Self {
            typing: TypingDebouncer::new(parts.config.typing_idle()),
            reconciler: Reconciler::new(parts.config.poll_interval()),
            chat: parts.chat,
            user_id: parts.user_id,
            user_name: parts.user_name,
            counterpart: parts.counterpart,
            listing: parts.listing,
            config: parts.config,
            messages,
            draft: String::new(),
            counterpart_typing: false,
            repository: parts.repository,
            notifier: parts.notifier,
            adapter: parts.adapter,
            sends: OptimisticSends::default(),
            answering: HashMap::new(),
            commands: parts.commands,
            transport_events: parts.transport_events,
            send_acks_tx,
            send_acks,
            poll_results_tx,
            poll_results,
            offer_results_tx,
            offer_results,
            read_acks_tx,
            read_acks,
            view,
            notices: parts.notices,
            cancel: parts.cancel,
        };
        (session_loop, view_rx)
    }

    pub fn snapshot(&self, closed: bool) -> SessionView {
        SessionView {
            chat: self.chat.clone(),
            counterpart: self.counterpart.clone(),
            listing: self.listing.clone(),
            messages: self.messages.clone(),
            draft: self.draft.clone(),
            counterpart_typing: self.counterpart_typing,
            closed,
        }
    }

    pub async fn run(mut self) {
        self.mark_visible_as_read();

        loop {
            let typing_deadline = self.typing.deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.transport_events.recv() => self.on_transport_event(event),
                Some(ack) = self.send_acks.recv() => self.on_send_ack(ack),
                Some(result) = self.poll_results.recv() => self.on_poll_result(result),
                Some(result) = self.offer_results.recv() => self.on_offer_result(result),
                Some(ack) = self.read_acks.recv() => self.on_read_ack(ack),
                _ = self.reconciler.due() => self.start_poll(),
                _ = idle_until(typing_deadline) => self.on_typing_idle(),
            }
        }

        self.shutdown().await;
    }

    fn publish(&self) {
        self.view.send_replace(self.snapshot(false));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendMessage { text, reply } => self.send_text(text, reply),
            Command::SendOffer {
                duration_days,
                extras,
                reply,
            } => self.send_offer(duration_days, extras, reply),
            Command::AnswerOffer {
                message_id,
                decision,
                reply,
            } => self.answer_offer(message_id, decision, reply),
            Command::InputChanged { text } => self.on_input_changed(text),
            Command::MarkRead { reply } => {
                let _ = reply.send(self.mark_visible_as_read());
            }
        }
    }

    // ---------- outbound messages ----------

    fn send_text(&mut self, text: String, reply: SendReply) {
        let content = text.trim();
        if content.is_empty() {
            let _ = reply.send(Err(ChatError::EmptyMessage));
            return;
        }

        let local = Message::local(&self.chat.id, &self.user_id, content, None);
        self.stop_typing();
        self.draft.clear();
        self.submit(local, Some(text), reply);
    }

    fn send_offer(&mut self, duration_days: u32, extras: Vec<OfferExtra>, reply: SendReply) {
        if self.chat.role_of(&self.user_id) != Some(ParticipantRole::Buyer) {
            let _ = reply.send(Err(ChatError::NotPermitted(
                "only the buyer can propose an offer".to_string(),
            )));
            return;
        }
        if self.listing.sold {
            let _ = reply.send(Err(ChatError::AlreadySold(self.listing.id.clone())));
            return;
        }

        let offer = match Offer::compose(&self.listing, duration_days, extras) {
            Ok(offer) => offer,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let local = Message::local(&self.chat.id, &self.user_id, offer.summary(), Some(offer));
        self.stop_typing();
        self.submit(local, None, reply);
    }

    fn submit(&mut self, local: Message, restore_text: Option<String>, reply: SendReply) {
        let local_id = local.id.clone();
        let request = self
            .sends
            .submit(&mut self.messages, local, restore_text, Some(reply));
        self.reconciler.gate_mut().send_started();
        self.publish();
        debug!("Submitted local message {}", local_id);

        send::persist(
            self.repository.clone(),
            local_id,
            request,
            self.send_acks_tx.clone(),
        );
    }

    fn on_send_ack(&mut self, ack: SendAck) {
        let Some(completion) = self.sends.complete(&mut self.messages, ack) else {
            return;
        };
        self.reconciler.gate_mut().send_finished();

        match completion {
            SendCompletion::Confirmed { message, reply } => {
                self.publish();
                self.notify_counterpart_of(&message);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(message));
                }
            }
            SendCompletion::Failed {
                restore_text,
                error,
                reply,
            } => {
                warn!("Send failed in chat {}: {}", self.chat.id, error);
                let sold = matches!(error, RepositoryError::ListingSold(_));
                if sold {
                    self.mark_listing_sold();
                }
                if let Some(text) = &restore_text {
                    if self.draft.trim().is_empty() {
                        self.draft = text.clone();
                    }
                }
                self.publish();
                let _ = self.notices.send(SessionNotice::SendFailed {
                    text: restore_text,
                    reason: error.to_string(),
                });
                if let Some(reply) = reply {
                    let error = if sold {
                        ChatError::AlreadySold(self.listing.id.clone())
                    } else {
                        ChatError::SendFailure(error)
                    };
                    let _ = reply.send(Err(error));
                }
            }
        }
    }

    fn notify_counterpart_of(&self, message: &Message) {
        let Some(recipient) = self.chat.counterpart_of(&self.user_id) else {
            return;
        };
        let link = self.config.chat_link(&self.chat.id);
        let notification = match &message.offer {
            Some(offer) => Notification::offer(recipient, &self.user_name, offer, link),
            None => Notification::message(recipient, &self.user_name, &message.content, link),
        };
        notify::dispatch(self.notifier.clone(), notification);
    }

    // ---------- offers ----------

    fn answer_offer(&mut self, message_id: String, decision: OfferDecision, reply: AnswerReply) {
        if self.answering.contains_key(&message_id) {
            let _ = reply.send(Err(ChatError::OfferBusy(message_id)));
            return;
        }
        let Some(message) = self.messages.iter().find(|m| m.id == message_id).cloned() else {
            let _ = reply.send(Err(ChatError::MessageNotFound(message_id)));
            return;
        };
        if let Err(e) = offer::authorize_answer(&self.chat, &message, &self.user_id) {
            let _ = reply.send(Err(e));
            return;
        }

        self.answering.insert(message_id.clone(), reply);

        let repository = self.repository.clone();
        let chat = self.chat.clone();
        let actor = self.user_id.clone();
        let results = self.offer_results_tx.clone();
        tokio::spawn(async move {
            let result = match decision {
                OfferDecision::Accept => offer::accept(repository.as_ref(), &chat, &message, &actor)
                    .await
                    .map(Settlement::Accepted),
                OfferDecision::Reject => offer::reject(repository.as_ref(), &chat, &message, &actor)
                    .await
                    .map(Settlement::Rejected),
            };
            let _ = results.send(OfferResult { message_id, result });
        });
    }

    fn on_offer_result(&mut self, outcome: OfferResult) {
        let reply = self.answering.remove(&outcome.message_id);
        let link = self.config.chat_link(&self.chat.id);

        let result = match outcome.result {
            Ok(Settlement::Accepted(accepted)) => {
                let offer_message = accepted.offer_message;
                merge::merge_message(&mut self.messages, offer_message.clone());
                if let Some(announcement) = accepted.announcement {
                    merge::merge_message(&mut self.messages, announcement);
                }
                self.mark_listing_sold();
                self.publish();

                if let Some(offer) = &offer_message.offer {
                    notify::dispatch(
                        self.notifier.clone(),
                        Notification::offer_accepted(
                            &offer_message.sender_id,
                            &self.user_name,
                            offer,
                            link,
                        ),
                    );
                }
                let _ = self.notices.send(SessionNotice::OfferSettled {
                    message_id: outcome.message_id,
                    status: OfferStatus::Accepted,
                });
                Ok(offer_message)
            }
            Ok(Settlement::Rejected(offer_message)) => {
                merge::merge_message(&mut self.messages, offer_message.clone());
                self.publish();

                if let Some(offer) = &offer_message.offer {
                    notify::dispatch(
                        self.notifier.clone(),
                        Notification::offer_rejected(
                            &offer_message.sender_id,
                            &self.user_name,
                            offer,
                            link,
                        ),
                    );
                }
                let _ = self.notices.send(SessionNotice::OfferSettled {
                    message_id: outcome.message_id,
                    status: OfferStatus::Rejected,
                });
                Ok(offer_message)
            }
            Err(ChatError::AlreadySold(listing_id)) => {
                self.mark_listing_sold();
                self.publish();
                let _ = self.notices.send(SessionNotice::AlreadySold {
                    message_id: outcome.message_id,
                });
                Err(ChatError::AlreadySold(listing_id))
            }
            Err(e) => {
                warn!("Answering offer {} failed: {}", outcome.message_id, e);
                Err(e)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    // ---------- inbound ----------

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageChanged { kind, message } => {
                if message.chat_id != self.chat.id {
                    debug!("Ignoring event for chat {}", message.chat_id);
                    return;
                }
                let id = message.id.clone();
                let outcome = if message.sender_id == self.user_id {
                    merge::merge_own(&mut self.messages, message, None)
                } else {
                    merge::merge_message(&mut self.messages, message)
                };
                debug!("Realtime {:?} of {}: {:?}", kind, id, outcome);
                if outcome != MergeOutcome::Unchanged {
                    self.after_inbound_change();
                }
            }
            TransportEvent::PresenceSync { typing } => {
                let counterpart_typing = presence::others_typing(&typing, &self.user_id);
                if counterpart_typing != self.counterpart_typing {
                    self.counterpart_typing = counterpart_typing;
                    self.publish();
                }
            }
        }
    }

    fn start_poll(&mut self) {
        let started = self.reconciler.start_poll(
            self.repository.clone(),
            self.chat.id.clone(),
            self.chat.listing_id.clone(),
            self.poll_results_tx.clone(),
        );
        if !started {
            debug!(
                "Skipping poll of {} ({} sends in flight)",
                self.chat.id,
                self.reconciler.gate().sends_in_flight()
            );
        }
    }

    fn on_poll_result(&mut self, result: PollResult) {
        let messages_fresh = self.reconciler.gate_mut().finish_poll(result.ticket);
        let listing_changed = self.refresh_listing(result.ticket, result.listing);

        if !messages_fresh {
            debug!("Discarding stale poll of {}", self.chat.id);
            if listing_changed {
                self.publish();
            }
            return;
        }

        match result.messages {
            Ok(messages) => {
                let summary = merge::merge_all(&mut self.messages, messages);
                if summary.changed() {
                    debug!(
                        "Poll of {} merged {} new, {} updated",
                        self.chat.id, summary.inserted, summary.updated
                    );
                    self.after_inbound_change();
                    return;
                }
            }
            Err(e) => warn!("Poll of {} failed: {}", self.chat.id, e),
        }
        if listing_changed {
            self.publish();
        }
    }

    /// Adopt a polled listing; `true` if the local copy changed
    fn refresh_listing(
        &mut self,
        ticket: PollTicket,
        listing: Result<Listing, RepositoryError>,
    ) -> bool {
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Listing refresh for {} failed: {}", self.chat.id, e);
                return false;
            }
        };
        // an accept in flight or finished since the read decides the sold flag
        if !self.answering.is_empty() || !self.reconciler.gate().listing_is_fresh(ticket) {
            return false;
        }
        if listing == self.listing {
            return false;
        }
        if listing.sold && !self.listing.sold {
            info!("Listing {} is now sold, seen from chat {}", listing.id, self.chat.id);
        }
        self.listing = listing;
        true
    }

    fn mark_listing_sold(&mut self) {
        if !self.listing.sold {
            self.listing.sold = true;
            self.reconciler.gate_mut().listing_changed();
        }
    }

    fn after_inbound_change(&mut self) {
        if self
            .messages
            .iter()
            .any(|m| m.offer_status() == Some(OfferStatus::Accepted))
        {
            self.mark_listing_sold();
        }
        self.publish();
        self.mark_visible_as_read();
    }

    // ---------- read receipts ----------

    fn mark_visible_as_read(&mut self) -> usize {
        let ids = receipts::unread_from_counterpart(&self.messages, &self.user_id);
        if ids.is_empty() {
            return 0;
        }

        let stamped_at = Utc::now();
        receipts::stamp_read(&mut self.messages, &ids, stamped_at);
        self.publish();

        let count = ids.len();
        let repository = self.repository.clone();
        let acks = self.read_acks_tx.clone();
        tokio::spawn(async move {
            let result = repository.mark_read(&ids).await;
            let _ = acks.send(ReadAck {
                ids,
                stamped_at,
                result,
            });
        });
        count
    }

    fn on_read_ack(&mut self, ack: ReadAck) {
        match ack.result {
            Ok(()) => debug!("Marked {} messages read", ack.ids.len()),
            Err(e) => {
                warn!("Failed to mark {} messages read: {}", ack.ids.len(), e);
                if receipts::revert_read(&mut self.messages, &ack.ids, ack.stamped_at) > 0 {
                    self.publish();
                }
            }
        }
    }

    // ---------- typing ----------

    fn on_input_changed(&mut self, text: String) {
        self.draft = text;
        if let Some(typing) = self.typing.input_changed(Instant::now()) {
            self.adapter.track(typing);
        }
        self.publish();
    }

    fn on_typing_idle(&mut self) {
        if let Some(typing) = self.typing.expire(Instant::now()) {
            self.adapter.track(typing);
        }
    }

    fn stop_typing(&mut self) {
        if let Some(typing) = self.typing.message_sent() {
            self.adapter.track(typing);
        }
    }

    async fn shutdown(&mut self) {
        self.stop_typing();
        self.adapter.close().await;
        self.view.send_replace(self.snapshot(true));
        info!(
            "Chat session {} closed for {} ({} writes abandoned)",
            self.chat.id,
            self.user_id,
            self.sends.len() + self.answering.len()
        );
    }
}

async fn idle_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
