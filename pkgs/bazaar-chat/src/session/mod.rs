//! Chat session controller
//!
//! [`ChatSession`] is the only thing the presentation layer talks to. Opening a
//! session loads the chat, checks that the current user takes part in it,
//! loads the history, then starts the realtime subscription, the reconciler and
//! the event loop that owns all session state.
//!
//! # Lifecycle
//!
//! - `open` fails with `Unauthorized` or `LoadError` before any background
//!   task starts; no partial session is ever exposed.
//! - `close` flushes a pending typing stop, leaves the realtime channel and
//!   stops the loop. It can be called any number of times.
//! - Dropping the handle without closing cancels the loop as well.

mod event_loop;
mod view;

pub use view::{SessionNotice, SessionView};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::error::ChatError;
use crate::model::{Message, OfferExtra};
use crate::notify::Notifier;
use crate::realtime::RealtimeAdapter;
use crate::repository::ChatRepository;
use crate::transport::Transport;
use event_loop::{Command, LoopParts, OfferDecision, SessionLoop};

/// External collaborators of a session
#[derive(Clone)]
pub struct SessionDeps {
    pub repository: Arc<dyn ChatRepository>,
    pub transport: Arc<dyn Transport>,
    pub notifier: Arc<dyn Notifier>,
}

/// Handle to an open negotiation session
pub struct ChatSession {
    chat_id: String,
    user_id: String,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Open the session of `current_user_id` on `chat_id`.
    ///
    /// Returns the session and the receiver of its [`SessionNotice`]s.
    #[instrument(skip(deps, config))]
    pub async fn open(
        chat_id: &str,
        current_user_id: &str,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionNotice>), ChatError> {
        let repository = deps.repository.clone();

        let chat = repository
            .get_chat(chat_id)
            .await
            .map_err(ChatError::LoadError)?;
        let Some(counterpart_id) = chat.counterpart_of(current_user_id) else {
            warn!("{} tried to open chat {}", current_user_id, chat_id);
            return Err(ChatError::Unauthorized {
                chat_id: chat_id.to_string(),
                user_id: current_user_id.to_string(),
            });
        };

        let counterpart = repository
            .get_profile(counterpart_id)
            .await
            .map_err(ChatError::LoadError)?;
        let user_name = match repository.get_profile(current_user_id).await {
            Ok(profile) => profile.display_name,
            Err(e) => {
                warn!("No profile for {}: {}", current_user_id, e);
                current_user_id.to_string()
            }
        };
        let listing = repository
            .get_listing(&chat.listing_id)
            .await
            .map_err(ChatError::LoadError)?;
        let history = repository
            .list_messages(chat_id)
            .await
            .map_err(ChatError::LoadError)?;

        info!(
            "Opened chat {} for {} with {} messages",
            chat_id,
            current_user_id,
            history.len()
        );

        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let adapter = RealtimeAdapter::start(
            deps.transport.clone(),
            chat.id.clone(),
            current_user_id.to_string(),
            &config,
            transport_tx,
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let (session_loop, view) = SessionLoop::new(LoopParts {
            chat,
            user_id: current_user_id.to_string(),
            user_name,
            counterpart,
            listing,
            history,
            repository,
            notifier: deps.notifier,
            adapter,
            transport_events,
            commands,
            notices: notices_tx,
            cancel: cancel.clone(),
            config,
        });
        let task = tokio::spawn(session_loop.run());

        Ok((
            Self {
                chat_id: chat_id.to_string(),
                user_id: current_user_id.to_string(),
                commands: commands_tx,
                view,
                cancel,
                task: Mutex::new(Some(task)),
            },
            notices,
        ))
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current snapshot
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver notified after every state change
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a text message.
    ///
    /// The message shows up in the view as a local pending entry right away;
    /// the returned future resolves once the repository acknowledged or refused
    /// the write. On refusal the text is restored to the input.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<Message, ChatError> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply })
            .await
    }

    /// Propose an offer on the listing. Buyers only.
    pub async fn send_offer(
        &self,
        duration_days: u32,
        extras: Vec<OfferExtra>,
    ) -> Result<Message, ChatError> {
        self.request(|reply| Command::SendOffer {
            duration_days,
            extras,
            reply,
        })
        .await
    }

    /// Accept the pending offer carried by `message_id`, selling the listing
    pub async fn accept_offer(&self, message_id: &str) -> Result<Message, ChatError> {
        self.answer(message_id, OfferDecision::Accept).await
    }

    /// Reject the pending offer carried by `message_id`
    pub async fn reject_offer(&self, message_id: &str) -> Result<Message, ChatError> {
        self.answer(message_id, OfferDecision::Reject).await
    }

    /// Input box changed; drives the typing indicator
    pub fn input_changed(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.commands
            .send(Command::InputChanged { text: text.into() })
            .map_err(|_| ChatError::SessionClosed)
    }

    /// Mark every unread counterpart message read. Returns how many were marked.
    pub async fn mark_visible_as_read(&self) -> Result<usize, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::MarkRead { reply })
            .map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Stop the session. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session loop for {} ended abnormally: {}", self.chat_id, e);
            }
        }
    }

    async fn answer(&self, message_id: &str, decision: OfferDecision) -> Result<Message, ChatError> {
        let message_id = message_id.to_string();
        self.request(|reply| Command::AnswerOffer {
            message_id,
            decision,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, ChatError>>) -> Command,
    ) -> Result<T, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
