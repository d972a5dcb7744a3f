//! Conversation turns, scoped to a chat epoch

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};

use super::{Storage, from_sql_ts, to_sql_ts};
use crate::Result;

/// Origin of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let role: String = row.get(3)?;
        let role = role.parse::<Role>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;
        let created_at: String = row.get(5)?;

        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            session_id: row.get(2)?,
            role,
            content: row.get(4)?,
            created_at: from_sql_ts(5, &created_at)?,
        })
    }
}

impl Storage {
    /// Append a turn to the chat's epoch `session_id`. Returns the row id.
    pub fn save_message(
        &self,
        chat_id: &str,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<i64> {
        let now = to_sql_ts(&self.now());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (chat_id, session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id, session_id, role.as_str(), content, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The last `limit` turns of an epoch, oldest first
    pub fn recent_messages(
        &self,
        chat_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, session_id, role, content, created_at FROM messages
             WHERE chat_id = ?1 AND session_id = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;

        let mut messages = stmt
            .query_map(params![chat_id, session_id, limit as i64], StoredMessage::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Number of turns stored for an epoch
    pub fn count_messages(&self, chat_id: &str, session_id: &str) -> Result<usize> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND session_id = ?2",
            params![chat_id, session_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
