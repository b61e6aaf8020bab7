//! Realtime transport adapter
//!
//! Keeps one chat channel subscribed for the lifetime of a session and
//! forwards its events to the session loop. Drops are absorbed here: the
//! adapter resets remote presence, waits with exponential backoff and
//! resubscribes, re-publishing the local typing state. Nothing is surfaced to
//! the session; messages missed while disconnected are recovered by the
//! reconciler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::transport::{ChannelHandle, Transport, TransportEvent};

enum AdapterCommand {
    Track(bool),
    Close,
}

/// Handle to the background subscription task
pub struct RealtimeAdapter {
    commands: mpsc::UnboundedSender<AdapterCommand>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeAdapter {
    /// Start the subscription task; events are forwarded to `sink`
    pub fn start(
        transport: Arc<dyn Transport>,
        chat_id: String,
        participant_id: String,
        config: &SessionConfig,
        sink: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(
            config.resubscribe_initial_backoff(),
            config.resubscribe_max_backoff(),
        );
        let task = tokio::spawn(run(
            transport,
            chat_id,
            participant_id,
            backoff,
            command_rx,
            sink,
        ));

        Self {
            commands,
            task: Some(task),
        }
    }

    /// Publish the local typing state
    pub fn track(&self, typing: bool) {
        let _ = self.commands.send(AdapterCommand::Track(typing));
    }

    /// Leave the channel and wait for the task to finish. Safe to call twice.
    pub async fn close(&mut self) {
        let _ = self.commands.send(AdapterCommand::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Realtime adapter task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RealtimeAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Exponential resubscribe delay
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// What ended a connected phase
enum Disconnect {
    Dropped,
    Closed,
}

async fn run(
    transport: Arc<dyn Transport>,
    chat_id: String,
    participant_id: String,
    mut backoff: Backoff,
    mut commands: mpsc::UnboundedReceiver<AdapterCommand>,
    sink: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut typing = false;

    loop {
        match transport.subscribe(&chat_id, &participant_id).await {
            Ok((handle, events)) => {
                info!("Subscribed to chat channel {}", chat_id);
                backoff.reset();
                let ended = connected(
                    handle.as_ref(),
                    events,
                    &mut commands,
                    &sink,
                    &mut typing,
                )
                .await;
                if let Disconnect::Closed = ended {
                    break;
                }
                warn!("Chat channel {} dropped, resubscribing", chat_id);
                let _ = sink.send(TransportEvent::PresenceSync {
                    typing: HashMap::new(),
                });
            }
            Err(e) => {
                warn!("Failed to subscribe to chat channel {}: {}", chat_id, e);
            }
        }

        let delay = backoff.next_delay();
        debug!("Resubscribing to {} in {:?}", chat_id, delay);
        if !wait(delay, &mut commands, &mut typing).await {
            break;
        }
    }

    debug!("Realtime adapter for {} stopped", chat_id);
}

async fn connected(
    handle: &dyn ChannelHandle,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: &mut mpsc::UnboundedReceiver<AdapterCommand>,
    sink: &mpsc::UnboundedSender<TransportEvent>,
    typing: &mut bool,
) -> Disconnect {
    if *typing {
        if let Err(e) = handle.track(true).await {
            warn!("Failed to restore typing state: {}", e);
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if sink.send(event).is_err() {
                        // session loop is gone
                        handle.close().await;
                        return Disconnect::Closed;
                    }
                }
                None => return Disconnect::Dropped,
            },
            command = commands.recv() => match command {
                Some(AdapterCommand::Track(value)) => {
                    *typing = value;
                    if let Err(e) = handle.track(value).await {
                        warn!("Failed to publish typing state: {}", e);
                    }
                }
                Some(AdapterCommand::Close) | None => {
                    handle.close().await;
                    return Disconnect::Closed;
                }
            },
        }
    }
}

/// Sleep for `delay` while still honouring commands. Returns `false` on close.
async fn wait(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<AdapterCommand>,
    typing: &mut bool,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(AdapterCommand::Track(value)) => *typing = value,
                Some(AdapterCommand::Close) | None => return false,
            },
        }
    }
}
