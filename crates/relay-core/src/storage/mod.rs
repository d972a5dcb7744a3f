//! Persistence layer
//!
//! SQLite is the source of truth for chat contexts, conversation turns,
//! tool-execution records and the cleanup/transfer audit log. Every
//! multi-statement operation runs inside a single transaction.

mod audit;
mod contexts;
mod messages;
pub mod migrations;
mod tools;

pub use audit::{CleanupKind, CleanupLogEntry, CleanupResult};
pub use contexts::{ChatContext, TransferResult};
pub use messages::{Role, StoredMessage};
pub use tools::ToolExecution;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::Connection;
use rusqlite::types::Type;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::{Error, Result};

/// SQLite-backed store
pub struct Storage {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Storage {
    /// Open (or create) the database at `db_path` and apply pending migrations.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        debug!("Opening database at: {}", db_path.display());
        let conn = Connection::open(db_path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("journal_mode = {}", mode);
        conn.busy_timeout(Duration::from_secs(5))?;

        let storage = Self::from_connection(conn)?;
        info!("Storage initialized at {}", db_path.display());
        Ok(storage)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source used for timestamps and expiry checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Applied schema version
    pub fn schema_version(&self) -> Result<u32> {
        migrations::current_version(&mut *self.conn()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Fixed-width UTC text so that lexical order equals chronological order.
pub(crate) fn to_sql_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_sql_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn deadline(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| Error::Config(format!("TTL out of range: {:?}", ttl)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_is_migrated() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.schema_version().unwrap(), migrations::latest_version());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        let storage = Storage::open(&path).unwrap();
        assert!(path.exists());
        drop(storage);

        // Reopening runs the migrator again without error.
        let reopened = Storage::open(&path).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), migrations::latest_version());
    }

    #[test]
    fn test_timestamp_text_orders_chronologically() {
        let earlier = Utc::now();
        let later = earlier + TimeDelta::milliseconds(1500);
        assert!(to_sql_ts(&earlier) < to_sql_ts(&later));
        assert_eq!(from_sql_ts(0, &to_sql_ts(&earlier)).unwrap().timestamp_micros(), earlier.timestamp_micros());
    }

    #[test]
    fn test_deadline_rejects_overflow() {
        assert!(deadline(Utc::now(), Duration::from_secs(u64::MAX)).is_err());
        assert!(deadline(Utc::now(), Duration::from_secs(60)).is_ok());
    }
}
