//! Bazaar Store - In-process collaborators for bazaar chat sessions
//!
//! Everything a [`bazaar_chat::ChatSession`] needs to run without a backend:
//!
//! - **MemoryRepository**: chats, profiles, listings and messages with
//!   server-assigned ids, conditional sold writes and injectable faults
//! - **RealtimeHub**: per-chat broadcast channels with a presence roster
//! - **NotificationLog**: records notifications instead of delivering them
//! - **Fixture**: JSON seed data for the repository
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use bazaar_store::Backend;
//!
//! # async fn example() -> Result<(), bazaar_chat::ChatError> {
//! let backend = Backend::new();
//! let deps = backend.deps();
//! # let _ = deps;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fixture;
pub mod memory_repository;
pub mod notification_log;
pub mod realtime_hub;

pub use error::StoreError;
pub use fixture::Fixture;
pub use memory_repository::{MemoryRepository, Operation};
pub use notification_log::NotificationLog;
pub use realtime_hub::{PresenceRecord, RealtimeHub, PRESENCE_LOG_CAPACITY};

use bazaar_chat::SessionDeps;
use std::sync::Arc;

/// Repository, hub and notification log wired together
#[derive(Clone)]
pub struct Backend {
    pub repository: Arc<MemoryRepository>,
    pub hub: RealtimeHub,
    pub notifications: NotificationLog,
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        let hub = RealtimeHub::new();
        Self {
            repository: Arc::new(MemoryRepository::with_hub(hub.clone())),
            hub,
            notifications: NotificationLog::new(),
        }
    }

    pub fn from_fixture(fixture: Fixture) -> Self {
        let hub = RealtimeHub::new();
        Self {
            repository: Arc::new(MemoryRepository::from_fixture(fixture, Some(hub.clone()))),
            hub,
            notifications: NotificationLog::new(),
        }
    }

    /// Session collaborators backed by this backend
    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            repository: self.repository.clone(),
            transport: Arc::new(self.hub.clone()),
            notifier: Arc::new(self.notifications.clone()),
        }
    }
}
