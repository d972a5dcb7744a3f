//! Error types for relay-core

use std::time::Duration;

use thiserror::Error;

/// Main error type for relay-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session capacity reached ({0} sessions)")]
    CapacityExceeded(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Context not found for chat: {0}")]
    ContextNotFound(String),

    #[error("Context not found or inactive for chat: {0}")]
    ContextInactive(String),

    #[error("Context not found or already active for chat: {0}")]
    ContextAlreadyActive(String),

    #[error("Conversation {0} is active in another chat")]
    ConversationInUse(String),

    #[error("Nothing to transfer from chat: {0}")]
    NothingToTransfer(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timed out after {0:?} waiting for a query slot")]
    QueueTimeout(Duration),

    #[error("Query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("Session registry is shutting down")]
    ShuttingDown,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] refinery::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// Short text suitable for showing to a chat user.
    pub fn user_message(&self) -> String {
        match self {
            Self::CapacityExceeded(_) | Self::QueueTimeout(_) => {
                "The assistant is busy right now. Please try again in a moment.".to_string()
            }
            Self::QueryTimeout(d) => {
                format!("The request took longer than {}s and was abandoned.", d.as_secs())
            }
            Self::SessionNotFound(_) | Self::ContextNotFound(_) | Self::ContextInactive(_) => {
                "There is no active conversation here, nothing to do.".to_string()
            }
            Self::ContextAlreadyActive(_) => "This conversation is already active.".to_string(),
            Self::ConversationInUse(_) => {
                "That conversation is currently active in another chat.".to_string()
            }
            Self::NothingToTransfer(_) => {
                "That chat has no conversation that can be transferred.".to_string()
            }
            Self::InvalidRequest(reason) => reason.clone(),
            Self::ShuttingDown => "The service is shutting down.".to_string(),
            _ => "Something went wrong. Please try again later.".to_string(),
        }
    }
}

/// Result type alias for relay-core
pub type Result<T> = std::result::Result<T, Error>;
