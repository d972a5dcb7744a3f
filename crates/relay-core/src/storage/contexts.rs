//! Chat context persistence and the transactional ownership operations

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::debug;

use super::audit::{CleanupKind, CleanupResult, append_entry};
use super::{Storage, deadline, from_sql_ts, to_sql_ts};
use crate::{Error, Result};

const CONTEXT_COLUMNS: &str = "id, chat_id, chat_type, session_id, conversation_id, \
     created_at, last_interaction, expires_at, is_active";

/// Durable binding of a chat to its current conversation epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatContext {
    pub id: i64,
    pub chat_id: String,
    pub chat_type: String,
    /// Local session id; identifies the current epoch
    pub session_id: String,
    /// Backend conversation id, absent until the backend assigns one
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ChatContext {
    /// Active and not past its deadline at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get(5)?;
        let last_interaction: String = row.get(6)?;
        let expires_at: String = row.get(7)?;
        let conversation_id: Option<String> = row.get(4)?;

        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            chat_type: row.get(2)?,
            session_id: row.get(3)?,
            conversation_id: conversation_id.filter(|id| !id.is_empty()),
            created_at: from_sql_ts(5, &created_at)?,
            last_interaction: from_sql_ts(6, &last_interaction)?,
            expires_at: from_sql_ts(7, &expires_at)?,
            is_active: row.get(8)?,
        })
    }
}

/// Outcome of a conversation transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub source_chat_id: String,
    /// Whether the source held the conversation actively when it was moved
    pub source_was_active: bool,
    pub target_chat_id: String,
    pub target_session_id: String,
    pub conversation_id: String,
    pub messages_transferred: usize,
    pub tools_transferred: usize,
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    Ok(n as usize)
}

fn select_context(conn: &Connection, chat_id: &str) -> Result<Option<ChatContext>> {
    let sql = format!("SELECT {} FROM chat_contexts WHERE chat_id = ?1", CONTEXT_COLUMNS);
    let ctx = conn
        .query_row(&sql, params![chat_id], ChatContext::from_row)
        .optional()?;
    Ok(ctx)
}

fn other_active_owner(conn: &Connection, conversation_id: &str, excluding_chat_id: &str) -> Result<bool> {
    let n = count(
        conn,
        "SELECT COUNT(*) FROM chat_contexts
         WHERE conversation_id = ?1 AND is_active = 1 AND chat_id != ?2",
        params![conversation_id, excluding_chat_id],
    )?;
    Ok(n > 0)
}

impl Storage {
    /// Create a fresh active context, replacing any row the chat already has.
    ///
    /// The replaced row's epoch and conversation id are dropped; its messages
    /// stay in place under the old session id.
    pub fn create_or_replace_context(
        &self,
        chat_id: &str,
        chat_type: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<ChatContext> {
        let now = self.now();
        let expires_at = deadline(now, ttl)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO chat_contexts
             (chat_id, chat_type, session_id, conversation_id, created_at, last_interaction, expires_at, is_active)
             VALUES (?1, ?2, ?3, NULL, ?4, ?4, ?5, 1)",
            params![chat_id, chat_type, session_id, to_sql_ts(&now), to_sql_ts(&expires_at)],
        )?;

        // last_insert_rowid is unreliable after INSERT OR REPLACE; read the row back.
        select_context(&conn, chat_id)?.ok_or_else(|| Error::ContextNotFound(chat_id.to_string()))
    }

    /// Load the context row for a chat, active or not
    pub fn get_context(&self, chat_id: &str) -> Result<Option<ChatContext>> {
        select_context(&*self.conn()?, chat_id)
    }

    /// Push the deadline of an active context out by `ttl` from now.
    pub fn refresh_context(&self, chat_id: &str, ttl: Duration) -> Result<()> {
        let now = self.now();
        let expires_at = deadline(now, ttl)?;

        let rows = self.conn()?.execute(
            "UPDATE chat_contexts SET last_interaction = ?1, expires_at = ?2
             WHERE chat_id = ?3 AND is_active = 1",
            params![to_sql_ts(&now), to_sql_ts(&expires_at), chat_id],
        )?;

        if rows == 0 {
            return Err(Error::ContextInactive(chat_id.to_string()));
        }
        Ok(())
    }

    /// All contexts ordered by last interaction, oldest first
    pub fn list_contexts(&self, include_inactive: bool) -> Result<Vec<ChatContext>> {
        let mut sql = format!("SELECT {} FROM chat_contexts", CONTEXT_COLUMNS);
        if !include_inactive {
            sql.push_str(" WHERE is_active = 1");
        }
        sql.push_str(" ORDER BY last_interaction ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let contexts = stmt
            .query_map([], ChatContext::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contexts)
    }

    /// Active contexts whose deadline has passed
    pub fn expired_contexts(&self) -> Result<Vec<ChatContext>> {
        let now = to_sql_ts(&self.now());
        let sql = format!(
            "SELECT {} FROM chat_contexts WHERE expires_at < ?1 AND is_active = 1",
            CONTEXT_COLUMNS
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let contexts = stmt
            .query_map(params![now], ChatContext::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(contexts)
    }

    pub fn active_context_count(&self) -> Result<usize> {
        count(
            &*self.conn()?,
            "SELECT COUNT(*) FROM chat_contexts WHERE is_active = 1",
            [],
        )
    }

    /// Record the backend conversation id for the chat's epoch `session_id`.
    ///
    /// Returns `false` when the row has moved on to another epoch or is no
    /// longer active, in which case nothing is written.
    pub fn set_conversation_id(
        &self,
        chat_id: &str,
        session_id: &str,
        conversation_id: &str,
    ) -> Result<bool> {
        let rows = self.conn()?.execute(
            "UPDATE chat_contexts SET conversation_id = ?1
             WHERE chat_id = ?2 AND session_id = ?3 AND is_active = 1",
            params![conversation_id, chat_id, session_id],
        )?;
        Ok(rows > 0)
    }

    /// Find the context holding a backend conversation. Prefers the active
    /// row, then the most recently used inactive one.
    pub fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<ChatContext>> {
        let sql = format!(
            "SELECT {} FROM chat_contexts WHERE conversation_id = ?1
             ORDER BY is_active DESC, last_interaction DESC LIMIT 1",
            CONTEXT_COLUMNS
        );
        let ctx = self
            .conn()?
            .query_row(&sql, params![conversation_id], ChatContext::from_row)
            .optional()?;
        Ok(ctx)
    }

    /// Whether a chat other than `excluding_chat_id` holds the conversation actively.
    pub fn has_other_active_owner(
        &self,
        conversation_id: &str,
        excluding_chat_id: &str,
    ) -> Result<bool> {
        other_active_owner(&*self.conn()?, conversation_id, excluding_chat_id)
    }

    /// Flip an inactive context back to active with a fresh deadline.
    ///
    /// The owner check and the flip share one transaction, so a conversation
    /// never ends up active in two chats.
    pub fn reactivate_context(&self, chat_id: &str, ttl: Duration) -> Result<ChatContext> {
        let now = self.now();
        let expires_at = deadline(now, ttl)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ctx = select_context(&tx, chat_id)?
            .ok_or_else(|| Error::ContextNotFound(chat_id.to_string()))?;
        if ctx.is_active {
            return Err(Error::ContextAlreadyActive(chat_id.to_string()));
        }
        if let Some(conversation_id) = &ctx.conversation_id {
            if other_active_owner(&tx, conversation_id, chat_id)? {
                return Err(Error::ConversationInUse(conversation_id.clone()));
            }
        }

        tx.execute(
            "UPDATE chat_contexts SET is_active = 1, last_interaction = ?1, expires_at = ?2
             WHERE chat_id = ?3 AND is_active = 0",
            params![to_sql_ts(&now), to_sql_ts(&expires_at), chat_id],
        )?;
        let ctx = select_context(&tx, chat_id)?
            .ok_or_else(|| Error::ContextNotFound(chat_id.to_string()))?;
        tx.commit()?;
        Ok(ctx)
    }

    /// Deactivate epoch `session_id` of a chat and append one audit entry,
    /// atomically.
    ///
    /// Messages and tool executions of the epoch are counted, not deleted;
    /// later epochs never see them because reads filter by session id.
    /// Returns `None` without writing anything when the chat has moved on to
    /// another epoch, or, for [`CleanupKind::Expired`], when the row is no
    /// longer active and past its deadline.
    pub fn deactivate_and_audit(
        &self,
        chat_id: &str,
        session_id: &str,
        kind: CleanupKind,
    ) -> Result<Option<CleanupResult>> {
        let now = self.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: String = tx
            .query_row(
                "SELECT session_id FROM chat_contexts WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::ContextNotFound(chat_id.to_string()))?;
        if current != session_id {
            debug!(chat_id, session_id, current = %current, "Epoch already replaced, not retiring");
            return Ok(None);
        }

        let messages_preserved = count(
            &tx,
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND session_id = ?2",
            params![chat_id, session_id],
        )?;
        let tools_preserved = count(
            &tx,
            "SELECT COUNT(*) FROM tool_executions WHERE chat_id = ?1 AND session_id = ?2",
            params![chat_id, session_id],
        )?;

        let rows = match kind {
            CleanupKind::Expired => tx.execute(
                "UPDATE chat_contexts SET is_active = 0
                 WHERE chat_id = ?1 AND session_id = ?2 AND is_active = 1 AND expires_at < ?3",
                params![chat_id, session_id, to_sql_ts(&now)],
            )?,
            _ => tx.execute(
                "UPDATE chat_contexts SET is_active = 0 WHERE chat_id = ?1 AND session_id = ?2",
                params![chat_id, session_id],
            )?,
        };
        if rows == 0 {
            debug!(chat_id, session_id, "Context no longer expired, not retiring");
            return Ok(None);
        }

        append_entry(&tx, chat_id, kind, messages_preserved, tools_preserved, &now)?;
        tx.commit()?;

        debug!(chat_id, %kind, messages_preserved, tools_preserved, "Context deactivated");
        Ok(Some(CleanupResult {
            messages_preserved,
            tools_preserved,
        }))
    }

    /// Move a backend conversation from `source_chat_id` to `target_chat_id`.
    ///
    /// In one transaction: the source row is deactivated, the target row is
    /// upserted with the same conversation id and epoch `new_session_id`,
    /// every message and tool execution of the source epoch is re-keyed to the
    /// target, and a transfer audit entry is appended.
    pub fn transfer_conversation(
        &self,
        source_chat_id: &str,
        target_chat_id: &str,
        target_chat_type: &str,
        new_session_id: &str,
        ttl: Duration,
    ) -> Result<TransferResult> {
        if source_chat_id == target_chat_id {
            return Err(Error::InvalidRequest(
                "Cannot transfer a conversation onto the chat that holds it".to_string(),
            ));
        }

        let now = self.now();
        let expires_at = deadline(now, ttl)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let source = select_context(&tx, source_chat_id)?
            .ok_or_else(|| Error::NothingToTransfer(source_chat_id.to_string()))?;
        let conversation_id = source
            .conversation_id
            .clone()
            .ok_or_else(|| Error::NothingToTransfer(source_chat_id.to_string()))?;

        // A dormant source may have lost the conversation to a third chat already.
        let other_owners = count(
            &tx,
            "SELECT COUNT(*) FROM chat_contexts
             WHERE conversation_id = ?1 AND is_active = 1 AND chat_id NOT IN (?2, ?3)",
            params![conversation_id, source_chat_id, target_chat_id],
        )?;
        if other_owners > 0 {
            return Err(Error::ConversationInUse(conversation_id));
        }

        let messages_transferred = count(
            &tx,
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![source.session_id],
        )?;
        let tools_transferred = count(
            &tx,
            "SELECT COUNT(*) FROM tool_executions WHERE session_id = ?1",
            params![source.session_id],
        )?;

        tx.execute(
            "UPDATE chat_contexts SET is_active = 0 WHERE chat_id = ?1",
            params![source_chat_id],
        )?;

        tx.execute(
            "INSERT OR REPLACE INTO chat_contexts
             (chat_id, chat_type, session_id, conversation_id, created_at, last_interaction, expires_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, 1)",
            params![
                target_chat_id,
                target_chat_type,
                new_session_id,
                conversation_id,
                to_sql_ts(&now),
                to_sql_ts(&expires_at),
            ],
        )?;

        tx.execute(
            "UPDATE messages SET chat_id = ?1, session_id = ?2 WHERE session_id = ?3",
            params![target_chat_id, new_session_id, source.session_id],
        )?;
        tx.execute(
            "UPDATE tool_executions SET chat_id = ?1, session_id = ?2 WHERE session_id = ?3",
            params![target_chat_id, new_session_id, source.session_id],
        )?;

        append_entry(
            &tx,
            source_chat_id,
            CleanupKind::Transfer,
            messages_transferred,
            tools_transferred,
            &now,
        )?;
        tx.commit()?;

        Ok(TransferResult {
            source_chat_id: source_chat_id.to_string(),
            source_was_active: source.is_active,
            target_chat_id: target_chat_id.to_string(),
            target_session_id: new_session_id.to_string(),
            conversation_id,
            messages_transferred,
            tools_transferred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::storage::Role;
    use chrono::TimeDelta;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(2 * 60 * 60);

    fn storage_with_clock() -> (Storage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let storage = Storage::in_memory().unwrap().with_clock(clock.clone());
        (storage, clock)
    }

    fn active_rows_for(storage: &Storage, conversation_id: &str) -> usize {
        storage
            .list_contexts(false)
            .unwrap()
            .iter()
            .filter(|c| c.conversation_id.as_deref() == Some(conversation_id))
            .count()
    }

    #[test]
    fn test_create_context() {
        let storage = Storage::in_memory().unwrap();
        let ctx = storage
            .create_or_replace_context("chat-1", "group", "epoch-a", TTL)
            .unwrap();

        assert_eq!(ctx.chat_id, "chat-1");
        assert_eq!(ctx.session_id, "epoch-a");
        assert!(ctx.is_active);
        assert!(ctx.conversation_id.is_none());
    }

    #[test]
    fn test_create_replaces_existing_row() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-1", "group", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-1", "epoch-a", "conv-1").unwrap();

        let replaced = storage
            .create_or_replace_context("chat-1", "group", "epoch-b", TTL)
            .unwrap();

        assert_eq!(replaced.session_id, "epoch-b");
        assert!(replaced.conversation_id.is_none());
        assert_eq!(storage.list_contexts(true).unwrap().len(), 1);
    }

    #[test]
    fn test_get_context_not_found() {
        let storage = Storage::in_memory().unwrap();
        assert!(storage.get_context("missing").unwrap().is_none());
    }

    #[test]
    fn test_refresh_moves_deadline_from_now() {
        let (storage, clock) = storage_with_clock();
        let t0 = clock.now();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();

        clock.advance(TimeDelta::minutes(30));
        storage.refresh_context("chat-1", TTL).unwrap();

        let ctx = storage.get_context("chat-1").unwrap().unwrap();
        assert_eq!(ctx.expires_at, t0 + TimeDelta::minutes(150));
        assert_eq!(ctx.last_interaction, t0 + TimeDelta::minutes(30));
    }

    #[test]
    fn test_refresh_inactive_fails() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();
        storage.deactivate_and_audit("chat-1", "epoch-a", CleanupKind::Manual).unwrap();

        let err = storage.refresh_context("chat-1", TTL).unwrap_err();
        assert!(matches!(err, Error::ContextInactive(_)));
        assert!(matches!(
            storage.refresh_context("nobody", TTL).unwrap_err(),
            Error::ContextInactive(_)
        ));
    }

    #[test]
    fn test_expired_contexts_only_returns_active_past_deadline() {
        let (storage, clock) = storage_with_clock();
        storage.create_or_replace_context("old", "private", "epoch-old", TTL).unwrap();
        storage.create_or_replace_context("dead", "private", "epoch-dead", TTL).unwrap();
        storage.deactivate_and_audit("dead", "epoch-dead", CleanupKind::Manual).unwrap();

        clock.advance(TimeDelta::hours(1));
        storage.create_or_replace_context("fresh", "private", "epoch-fresh", TTL).unwrap();

        clock.advance(TimeDelta::minutes(61));
        let expired = storage.expired_contexts().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].chat_id, "old");
    }

    #[test]
    fn test_deactivate_and_audit_preserves_epoch_data() {
        let (storage, clock) = storage_with_clock();
        storage.create_or_replace_context("chat-1", "group", "epoch-a", TTL).unwrap();
        storage.save_message("chat-1", "epoch-a", Role::User, "hello").unwrap();
        storage.save_message("chat-1", "epoch-a", Role::Assistant, "hi").unwrap();
        storage.save_tool_execution("chat-1", "epoch-a", "Bash", "success").unwrap();

        clock.advance(TimeDelta::hours(3));
        let result = storage
            .deactivate_and_audit("chat-1", "epoch-a", CleanupKind::Expired)
            .unwrap()
            .unwrap();
        assert_eq!(result.messages_preserved, 2);
        assert_eq!(result.tools_preserved, 1);

        assert!(!storage.get_context("chat-1").unwrap().unwrap().is_active);
        assert_eq!(storage.recent_messages("chat-1", "epoch-a", 10).unwrap().len(), 2);

        let log = storage.cleanup_log("chat-1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, CleanupKind::Expired);
        assert_eq!(log[0].messages_count, 2);
    }

    #[test]
    fn test_deactivate_and_audit_missing_context_writes_nothing() {
        let storage = Storage::in_memory().unwrap();
        let err = storage.deactivate_and_audit("ghost", "epoch-x", CleanupKind::Manual).unwrap_err();
        assert!(matches!(err, Error::ContextNotFound(_)));
        assert!(storage.cleanup_log("ghost").unwrap().is_empty());
    }

    /// Make every audit append fail so a transaction errors after its
    /// earlier writes have run.
    fn break_audit_log(storage: &Storage) {
        storage
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_audit BEFORE INSERT ON cleanup_log
                 BEGIN SELECT RAISE(ABORT, 'audit log unavailable'); END;",
            )
            .unwrap();
    }

    #[test]
    fn test_deactivate_and_audit_ignores_replaced_epoch() {
        let (storage, clock) = storage_with_clock();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();
        clock.advance(TimeDelta::hours(3));
        storage.create_or_replace_context("chat-1", "private", "epoch-b", TTL).unwrap();

        let result = storage
            .deactivate_and_audit("chat-1", "epoch-a", CleanupKind::Expired)
            .unwrap();
        assert!(result.is_none());

        let ctx = storage.get_context("chat-1").unwrap().unwrap();
        assert_eq!(ctx.session_id, "epoch-b");
        assert!(ctx.is_active);
        assert!(storage.cleanup_log("chat-1").unwrap().is_empty());
    }

    #[test]
    fn test_expired_retirement_requires_passed_deadline() {
        let (storage, clock) = storage_with_clock();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();
        clock.advance(TimeDelta::hours(3));
        storage.refresh_context("chat-1", TTL).unwrap();

        let result = storage
            .deactivate_and_audit("chat-1", "epoch-a", CleanupKind::Expired)
            .unwrap();
        assert!(result.is_none());
        assert!(storage.get_context("chat-1").unwrap().unwrap().is_active);
        assert!(storage.cleanup_log("chat-1").unwrap().is_empty());
    }

    #[test]
    fn test_deactivate_and_audit_rolls_back_when_audit_fails() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();
        storage.save_message("chat-1", "epoch-a", Role::User, "hello").unwrap();
        break_audit_log(&storage);

        assert!(storage
            .deactivate_and_audit("chat-1", "epoch-a", CleanupKind::Manual)
            .is_err());

        let ctx = storage.get_context("chat-1").unwrap().unwrap();
        assert!(ctx.is_active);
        assert_eq!(ctx.session_id, "epoch-a");
        assert_eq!(storage.count_messages("chat-1", "epoch-a").unwrap(), 1);
    }

    #[test]
    fn test_transfer_rolls_back_when_audit_fails() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();
        storage.save_message("chat-a", "epoch-a", Role::User, "one").unwrap();
        storage.save_tool_execution("chat-a", "epoch-a", "Read", "success").unwrap();
        storage.create_or_replace_context("chat-b", "group", "epoch-b0", TTL).unwrap();
        break_audit_log(&storage);

        assert!(storage
            .transfer_conversation("chat-a", "chat-b", "group", "epoch-b1", TTL)
            .is_err());

        let source = storage.get_context("chat-a").unwrap().unwrap();
        assert!(source.is_active);
        assert_eq!(source.conversation_id.as_deref(), Some("conv-1"));

        let target = storage.get_context("chat-b").unwrap().unwrap();
        assert_eq!(target.session_id, "epoch-b0");
        assert!(target.conversation_id.is_none());

        assert_eq!(storage.count_messages("chat-a", "epoch-a").unwrap(), 1);
        assert_eq!(storage.count_messages("chat-b", "epoch-b1").unwrap(), 0);
        assert_eq!(storage.tool_executions("chat-a", "epoch-a", 10).unwrap().len(), 1);
        assert_eq!(active_rows_for(&storage, "conv-1"), 1);
    }

    #[test]
    fn test_reactivate_refused_after_conversation_moved_on() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();
        storage.transfer_conversation("chat-a", "chat-b", "private", "epoch-b", TTL).unwrap();
        storage.deactivate_and_audit("chat-b", "epoch-b", CleanupKind::Manual).unwrap();

        // Both chats are dormant on conv-1 when chat-c picks it up.
        assert!(!storage.has_other_active_owner("conv-1", "chat-a").unwrap());
        storage.transfer_conversation("chat-b", "chat-c", "private", "epoch-c", TTL).unwrap();

        let err = storage.reactivate_context("chat-a", TTL).unwrap_err();
        assert!(matches!(err, Error::ConversationInUse(_)));
        assert!(!storage.get_context("chat-a").unwrap().unwrap().is_active);
        assert_eq!(active_rows_for(&storage, "conv-1"), 1);
    }

    #[test]
    fn test_transfer_rekeys_history() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();
        storage.save_message("chat-a", "epoch-a", Role::User, "one").unwrap();
        storage.save_message("chat-a", "epoch-a", Role::Assistant, "two").unwrap();
        storage.save_message("chat-a", "epoch-a", Role::User, "three").unwrap();
        storage.save_tool_execution("chat-a", "epoch-a", "Read", "success").unwrap();

        let result = storage
            .transfer_conversation("chat-a", "chat-b", "group", "epoch-b", TTL)
            .unwrap();

        assert!(result.source_was_active);
        assert_eq!(result.conversation_id, "conv-1");
        assert_eq!(result.messages_transferred, 3);
        assert_eq!(result.tools_transferred, 1);

        let owner = storage.find_by_conversation_id("conv-1").unwrap().unwrap();
        assert_eq!(owner.chat_id, "chat-b");
        assert_eq!(owner.session_id, "epoch-b");
        assert!(owner.is_active);
        assert!(!storage.get_context("chat-a").unwrap().unwrap().is_active);

        assert!(storage.recent_messages("chat-a", "epoch-a", 10).unwrap().is_empty());
        let moved = storage.recent_messages("chat-b", "epoch-b", 10).unwrap();
        assert_eq!(moved.len(), result.messages_transferred);
        assert_eq!(moved[0].content, "one");
        assert_eq!(storage.tool_executions("chat-b", "epoch-b", 10).unwrap().len(), 1);

        assert_eq!(active_rows_for(&storage, "conv-1"), 1);
        let log = storage.cleanup_log("chat-a").unwrap();
        assert_eq!(log.last().unwrap().kind, CleanupKind::Transfer);
    }

    #[test]
    fn test_transfer_from_inactive_source_reports_it() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();
        storage.deactivate_and_audit("chat-a", "epoch-a", CleanupKind::Manual).unwrap();

        let result = storage
            .transfer_conversation("chat-a", "chat-b", "private", "epoch-b", TTL)
            .unwrap();
        assert!(!result.source_was_active);
    }

    #[test]
    fn test_transfer_refuses_conversation_held_elsewhere() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();
        storage.transfer_conversation("chat-a", "chat-b", "private", "epoch-b", TTL).unwrap();

        // chat-a still remembers conv-1 but chat-b holds it now.
        let err = storage
            .transfer_conversation("chat-a", "chat-c", "private", "epoch-c", TTL)
            .unwrap_err();
        assert!(matches!(err, Error::ConversationInUse(_)));
        assert!(storage.get_context("chat-c").unwrap().is_none());
        assert_eq!(active_rows_for(&storage, "conv-1"), 1);
    }

    #[test]
    fn test_transfer_without_conversation_rolls_back() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();

        let err = storage
            .transfer_conversation("chat-a", "chat-b", "private", "epoch-b", TTL)
            .unwrap_err();
        assert!(matches!(err, Error::NothingToTransfer(_)));

        assert!(storage.get_context("chat-a").unwrap().unwrap().is_active);
        assert!(storage.get_context("chat-b").unwrap().is_none());
        assert!(storage.cleanup_log("chat-a").unwrap().is_empty());
    }

    #[test]
    fn test_transfer_missing_source() {
        let storage = Storage::in_memory().unwrap();
        let err = storage
            .transfer_conversation("ghost", "chat-b", "private", "epoch-b", TTL)
            .unwrap_err();
        assert!(matches!(err, Error::NothingToTransfer(_)));
    }

    #[test]
    fn test_transfer_onto_same_chat_rejected() {
        let storage = Storage::in_memory().unwrap();
        let err = storage
            .transfer_conversation("chat-a", "chat-a", "private", "epoch-b", TTL)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_set_conversation_id_ignores_stale_epoch() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();
        storage.create_or_replace_context("chat-1", "private", "epoch-b", TTL).unwrap();

        assert!(!storage.set_conversation_id("chat-1", "epoch-a", "conv-old").unwrap());
        assert!(storage.set_conversation_id("chat-1", "epoch-b", "conv-new").unwrap());
        assert_eq!(
            storage.get_context("chat-1").unwrap().unwrap().conversation_id.as_deref(),
            Some("conv-new")
        );
    }

    #[test]
    fn test_has_other_active_owner() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();

        assert!(storage.has_other_active_owner("conv-1", "chat-b").unwrap());
        assert!(!storage.has_other_active_owner("conv-1", "chat-a").unwrap());

        storage.deactivate_and_audit("chat-a", "epoch-a", CleanupKind::Manual).unwrap();
        assert!(!storage.has_other_active_owner("conv-1", "chat-b").unwrap());
    }

    #[test]
    fn test_reactivate_context() {
        let (storage, clock) = storage_with_clock();
        storage.create_or_replace_context("chat-1", "private", "epoch-a", TTL).unwrap();

        let err = storage.reactivate_context("chat-1", TTL).unwrap_err();
        assert!(matches!(err, Error::ContextAlreadyActive(_)));

        storage.deactivate_and_audit("chat-1", "epoch-a", CleanupKind::Manual).unwrap();
        clock.advance(TimeDelta::hours(5));
        storage.reactivate_context("chat-1", TTL).unwrap();

        let ctx = storage.get_context("chat-1").unwrap().unwrap();
        assert!(ctx.is_live(clock.now()));
        assert_eq!(ctx.session_id, "epoch-a");
        assert!(matches!(
            storage.reactivate_context("nobody", TTL).unwrap_err(),
            Error::ContextNotFound(_)
        ));
    }

    #[test]
    fn test_find_by_conversation_prefers_active() {
        let (storage, clock) = storage_with_clock();
        storage.create_or_replace_context("chat-a", "private", "epoch-a", TTL).unwrap();
        storage.set_conversation_id("chat-a", "epoch-a", "conv-1").unwrap();
        storage.transfer_conversation("chat-a", "chat-b", "private", "epoch-b", TTL).unwrap();

        clock.advance(TimeDelta::minutes(1));
        storage.refresh_context("chat-b", TTL).unwrap();

        let found = storage.find_by_conversation_id("conv-1").unwrap().unwrap();
        assert_eq!(found.chat_id, "chat-b");
        assert!(storage.find_by_conversation_id("conv-unknown").unwrap().is_none());
    }

    #[test]
    fn test_active_context_count() {
        let storage = Storage::in_memory().unwrap();
        storage.create_or_replace_context("a", "private", "e1", TTL).unwrap();
        storage.create_or_replace_context("b", "private", "e2", TTL).unwrap();
        storage.deactivate_and_audit("b", "e2", CleanupKind::Manual).unwrap();
        assert_eq!(storage.active_context_count().unwrap(), 1);
    }
}
