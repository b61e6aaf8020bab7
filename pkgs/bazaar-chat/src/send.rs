//! Optimistic send pipeline
//!
//! A submitted message is appended to the local list synchronously, before any
//! suspension point, as a local optimistic message. The write then runs in the
//! background and its acknowledgment either replaces the local entry in place
//! or rolls it back.
//!
//! The push copy of a write may arrive before its acknowledgment and take the
//! place of a local entry first (see [`merge::merge_own`]). Acknowledgments
//! then only reconcile the count: the list always holds one entry per
//! submitted message.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{ChatError, RepositoryError};
use crate::merge;
use crate::model::{Message, NewMessage};
use crate::repository::ChatRepository;

pub(crate) type SendReply = oneshot::Sender<Result<Message, ChatError>>;

/// Repository answer for one optimistic message
#[derive(Debug)]
pub struct SendAck {
    pub local_id: String,
    pub result: Result<Message, RepositoryError>,
}

/// How an acknowledged send ended
#[derive(Debug)]
pub(crate) enum SendCompletion {
    Confirmed {
        message: Message,
        reply: Option<SendReply>,
    },
    Failed {
        /// Text to put back into the input, if the send came from it
        restore_text: Option<String>,
        error: RepositoryError,
        reply: Option<SendReply>,
    },
}

struct InFlight {
    local: Message,
    restore_text: Option<String>,
    reply: Option<SendReply>,
}

/// Local optimistic messages awaiting acknowledgment
#[derive(Default)]
pub(crate) struct OptimisticSends {
    in_flight: HashMap<String, InFlight>,
}

impl OptimisticSends {
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Append `local` to the list and remember how to roll it back
    pub fn submit(
        &mut self,
        messages: &mut Vec<Message>,
        local: Message,
        restore_text: Option<String>,
        reply: Option<SendReply>,
    ) -> NewMessage {
        let request = NewMessage::from(&local);
        self.in_flight.insert(
            local.id.clone(),
            InFlight {
                local: local.clone(),
                restore_text,
                reply,
            },
        );
        messages.push(local);
        merge::sort_messages(messages);
        request
    }

    /// Apply an acknowledgment to the list
    pub fn complete(&mut self, messages: &mut Vec<Message>, ack: SendAck) -> Option<SendCompletion> {
        let Some(entry) = self.in_flight.remove(&ack.local_id) else {
            debug!("Acknowledgment for unknown local message {}", ack.local_id);
            return None;
        };

        match ack.result {
            Ok(message) => {
                let known = messages.iter().any(|m| m.id == message.id);
                merge::merge_own(messages, message.clone(), Some(&ack.local_id));
                // a copy delivered earlier may have taken another entry's place,
                // in which case this one now stands in for that send
                if known && merge::local_count(messages) > self.in_flight.len() {
                    merge::discard_local(messages, &ack.local_id);
                }
                Some(SendCompletion::Confirmed {
                    message,
                    reply: entry.reply,
                })
            }
            Err(error) => {
                if merge::discard_local(messages, &ack.local_id).is_none() {
                    discard_twin(messages, &entry.local);
                }
                Some(SendCompletion::Failed {
                    restore_text: entry.restore_text,
                    error,
                    reply: entry.reply,
                })
            }
        }
    }
}

fn discard_twin(messages: &mut Vec<Message>, local: &Message) {
    if let Some(index) = messages
        .iter()
        .position(|m| m.is_local() && m.same_submission(local))
    {
        messages.remove(index);
    }
}

/// Run the repository write in the background
pub(crate) fn persist(
    repository: Arc<dyn ChatRepository>,
    local_id: String,
    request: NewMessage,
    acks: mpsc::UnboundedSender<SendAck>,
) {
    tokio::spawn(async move {
        let result = repository.insert_message(request).await;
        // a closed session discards the result
        let _ = acks.send(SendAck { local_id, result });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server_copy(local: &Message, id: &str) -> Message {
        Message {
            id: id.to_string(),
            created_at: Utc::now(),
            pending: false,
            ..local.clone()
        }
    }

    #[test]
    fn test_submit_appends_immediately() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let local = Message::local("chat-1", "buyer", "Merhaba", None);

        let request = sends.submit(&mut messages, local.clone(), Some("Merhaba".into()), None);

        assert_eq!(request.content, "Merhaba");
        assert_eq!(messages, vec![local]);
        assert!(messages[0].pending);
        assert_eq!(sends.len(), 1);
    }

    #[test]
    fn test_success_replaces_local_entry() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let local = Message::local("chat-1", "buyer", "Merhaba", None);
        sends.submit(&mut messages, local.clone(), None, None);

        let confirmed = server_copy(&local, "srv-1");
        let completion = sends.complete(
            &mut messages,
            SendAck {
                local_id: local.id.clone(),
                result: Ok(confirmed.clone()),
            },
        );

        assert!(matches!(completion, Some(SendCompletion::Confirmed { .. })));
        assert_eq!(messages, vec![confirmed]);
        assert_eq!(sends.len(), 0);
    }

    #[test]
    fn test_failure_removes_local_entry_and_restores_text() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let local = Message::local("chat-1", "buyer", "Merhaba", None);
        sends.submit(&mut messages, local.clone(), Some("Merhaba".into()), None);

        let completion = sends.complete(
            &mut messages,
            SendAck {
                local_id: local.id.clone(),
                result: Err(RepositoryError::Unavailable("offline".into())),
            },
        );

        match completion {
            Some(SendCompletion::Failed { restore_text, .. }) => {
                assert_eq!(restore_text.as_deref(), Some("Merhaba"))
            }
            other => panic!("unexpected completion: {:?}", other),
        }
        assert!(messages.is_empty());
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let completion = sends.complete(
            &mut messages,
            SendAck {
                local_id: "local-unknown".into(),
                result: Err(RepositoryError::Unavailable("offline".into())),
            },
        );
        assert!(completion.is_none());
    }

    fn ack(local: &Message, result: Result<Message, RepositoryError>) -> SendAck {
        SendAck {
            local_id: local.id.clone(),
            result,
        }
    }

    #[test]
    fn test_push_copy_before_ack_is_never_duplicated() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let local = Message::local("chat-1", "buyer", "Merhaba", None);
        sends.submit(&mut messages, local.clone(), None, None);

        let confirmed = server_copy(&local, "srv-1");
        merge::merge_own(&mut messages, confirmed.clone(), None);
        assert_eq!(messages, vec![confirmed.clone()]);

        let completion = sends.complete(&mut messages, ack(&local, Ok(confirmed.clone())));
        assert!(matches!(completion, Some(SendCompletion::Confirmed { .. })));
        assert_eq!(messages, vec![confirmed]);
    }

    #[test]
    fn test_identical_sends_resolve_out_of_order() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let first = Message::local("chat-1", "buyer", "tamam", None);
        let second = Message::local("chat-1", "buyer", "tamam", None);
        sends.submit(&mut messages, first.clone(), None, None);
        sends.submit(&mut messages, second.clone(), None, None);

        // the second write's copy lands in whichever slot comes first
        let second_copy = server_copy(&second, "srv-2");
        merge::merge_own(&mut messages, second_copy.clone(), None);
        assert_eq!(messages.len(), 2);

        let first_copy = server_copy(&first, "srv-1");
        sends.complete(&mut messages, ack(&first, Ok(first_copy.clone())));
        assert_eq!(messages.len(), 2);
        assert_eq!(merge::local_count(&messages), 0);

        sends.complete(&mut messages, ack(&second, Ok(second_copy)));
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.id == "srv-1"));
        assert!(messages.iter().any(|m| m.id == "srv-2"));
    }

    #[test]
    fn test_failure_after_twin_copy_keeps_count() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let first = Message::local("chat-1", "buyer", "tamam", None);
        let second = Message::local("chat-1", "buyer", "tamam", None);
        sends.submit(&mut messages, first.clone(), None, None);
        sends.submit(&mut messages, second.clone(), None, None);

        // the copy of the second write takes the first slot, then the first write fails
        let second_copy = server_copy(&second, "srv-2");
        merge::merge_own(&mut messages, second_copy.clone(), Some(&first.id));
        sends.complete(
            &mut messages,
            ack(&first, Err(RepositoryError::Unavailable("offline".into()))),
        );
        assert_eq!(messages, vec![second_copy.clone()]);

        sends.complete(&mut messages, ack(&second, Ok(second_copy.clone())));
        assert_eq!(messages, vec![second_copy]);
    }

    #[test]
    fn test_unmatched_push_copy_does_not_leave_local_behind() {
        let mut messages = Vec::new();
        let mut sends = OptimisticSends::default();
        let local = Message::local("chat-1", "buyer", "Merhaba", None);
        sends.submit(&mut messages, local.clone(), None, None);

        // the stored text differs, so the copy cannot be matched to the local entry
        let stored = Message {
            content: "Merhaba!".to_string(),
            ..server_copy(&local, "srv-1")
        };
        merge::merge_own(&mut messages, stored.clone(), None);
        assert_eq!(messages.len(), 2);

        sends.complete(&mut messages, ack(&local, Ok(stored.clone())));
        assert_eq!(messages, vec![stored]);
    }
}
