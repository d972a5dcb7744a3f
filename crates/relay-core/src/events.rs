//! Lifecycle event sink
//!
//! Every context/session transition is reported here as one structured
//! `tracing` event under the `relay::lifecycle` target. Emission is
//! best-effort and never fails the caller.

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Event severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Normal lifecycle transitions
    Info,
    /// Rejections and failures
    Warning,
}

/// Types of lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    // Context events
    ContextCreated,
    ContextSuperseded,
    ContextRefreshed,
    ContextRetired,
    ContextReactivated,
    ConversationTransferred,

    // Session events
    SessionCreated,
    SessionKilled,
    SessionsSwept,
    CapacityRejected,

    // Query events
    QueryCompleted,
    QueryFailed,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextCreated => "context_created",
            Self::ContextSuperseded => "context_superseded",
            Self::ContextRefreshed => "context_refreshed",
            Self::ContextRetired => "context_retired",
            Self::ContextReactivated => "context_reactivated",
            Self::ConversationTransferred => "conversation_transferred",
            Self::SessionCreated => "session_created",
            Self::SessionKilled => "session_killed",
            Self::SessionsSwept => "sessions_swept",
            Self::CapacityRejected => "capacity_rejected",
            Self::QueryCompleted => "query_completed",
            Self::QueryFailed => "query_failed",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            Self::CapacityRejected | Self::QueryFailed => EventLevel::Warning,
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emit a lifecycle event for `chat_id` (or a session id when no chat applies).
pub fn emit(event: LifecycleEvent, chat_id: &str, detail: impl fmt::Display) {
    match event.level() {
        EventLevel::Info => info!(
            target: "relay::lifecycle",
            event = event.as_str(),
            chat_id,
            "{}",
            detail
        ),
        EventLevel::Warning => warn!(
            target: "relay::lifecycle",
            event = event.as_str(),
            chat_id,
            "{}",
            detail
        ),
    }
}
