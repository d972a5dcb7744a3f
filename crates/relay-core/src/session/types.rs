//! Session types

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// In-memory handle for one active conversation epoch
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Local session id (the epoch this handle serves)
    pub session_id: String,
    /// Chat the epoch belongs to
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    /// Last successful query. Starts at `created_at`.
    pub last_used: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, chat_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            chat_id: chat_id.into(),
            created_at: now,
            last_used: now,
        }
    }

    /// Time since the last successful query (or creation)
    pub fn idle_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_used
    }
}
