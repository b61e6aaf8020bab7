//! Notification collaborator that records what it was asked to deliver

use async_trait::async_trait;
use bazaar_chat::{Notification, NotificationKind, Notifier, RepositoryError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct LogState {
    delivered: Vec<Notification>,
    failing: bool,
}

/// Records delivered notifications in memory
#[derive(Clone, Default)]
pub struct NotificationLog {
    state: Arc<Mutex<LogState>>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every delivery while `failing` is set
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.state.lock().delivered.clone()
    }

    /// Deliveries addressed to `user_id`
    pub fn for_user(&self, user_id: &str) -> Vec<Notification> {
        self.state
            .lock()
            .delivered
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        self.state
            .lock()
            .delivered
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for NotificationLog {
    async fn notify(&self, notification: Notification) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(RepositoryError::Unavailable(
                "notification service offline".to_string(),
            ));
        }
        info!(
            "Notification for {}: {} ({})",
            notification.user_id, notification.title, notification.link
        );
        state.delivered.push(notification);
        Ok(())
    }
}
