//! Tool-execution audit trail

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{Storage, from_sql_ts, to_sql_ts};
use crate::Result;

/// A side effect the backend reported while answering a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExecution {
    pub id: i64,
    pub chat_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub fn save_tool_execution(
        &self,
        chat_id: &str,
        session_id: &str,
        tool_name: &str,
        status: &str,
    ) -> Result<i64> {
        let now = to_sql_ts(&self.now());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tool_executions (chat_id, session_id, tool_name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id, session_id, tool_name, status, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent executions of an epoch, newest first
    pub fn tool_executions(
        &self,
        chat_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ToolExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, session_id, tool_name, status, created_at FROM tool_executions
             WHERE chat_id = ?1 AND session_id = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![chat_id, session_id, limit as i64], |row| {
            let created_at: String = row.get(5)?;
            Ok(ToolExecution {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                session_id: row.get(2)?,
                tool_name: row.get(3)?,
                status: row.get(4)?,
                created_at: from_sql_ts(5, &created_at)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
