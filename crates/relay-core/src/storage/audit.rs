//! Cleanup/transfer audit log (append-only)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use super::{Storage, from_sql_ts, to_sql_ts};
use crate::Result;

/// Why a context was retired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupKind {
    Expired,
    Manual,
    Transfer,
}

impl CleanupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Manual => "manual",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for CleanupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleanupKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "expired" => Ok(Self::Expired),
            "manual" => Ok(Self::Manual),
            "transfer" => Ok(Self::Transfer),
            other => Err(format!("unknown cleanup kind: {}", other)),
        }
    }
}

/// Counts reported by a retirement. Data is kept, only counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupResult {
    pub messages_preserved: usize,
    pub tools_preserved: usize,
}

/// One row of the audit log
#[derive(Debug, Clone, Serialize)]
pub struct CleanupLogEntry {
    pub id: i64,
    pub chat_id: String,
    pub kind: CleanupKind,
    pub messages_count: usize,
    pub tools_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Append an entry. Callers pass the open transaction.
pub(crate) fn append_entry(
    conn: &Connection,
    chat_id: &str,
    kind: CleanupKind,
    messages_count: usize,
    tools_count: usize,
    at: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO cleanup_log (chat_id, kind, messages_count, tools_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            chat_id,
            kind.as_str(),
            messages_count as i64,
            tools_count as i64,
            to_sql_ts(at),
        ],
    )?;
    Ok(())
}

impl Storage {
    /// Audit entries for a chat, oldest first
    pub fn cleanup_log(&self, chat_id: &str) -> Result<Vec<CleanupLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, kind, messages_count, tools_count, created_at
             FROM cleanup_log WHERE chat_id = ?1 ORDER BY id ASC",
        )?;

        let entries = stmt
            .query_map(params![chat_id], |row| {
                let kind_str: String = row.get(2)?;
                let kind = kind_str.parse::<CleanupKind>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?;
                let messages: i64 = row.get(3)?;
                let tools: i64 = row.get(4)?;
                let created_at: String = row.get(5)?;

                Ok(CleanupLogEntry {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    kind,
                    messages_count: messages as usize,
                    tools_count: tools as usize,
                    created_at: from_sql_ts(5, &created_at)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}
