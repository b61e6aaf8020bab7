//! Error types for the in-memory store

use thiserror::Error;

/// Errors raised while loading a store fixture
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid fixture: {0}")]
    InvalidFixture(String),
}
