//! Embedded schema migrations
//!
//! The SQL scripts under `migrations/` are compiled in with refinery and
//! applied on open. Refinery records each applied version in
//! `refinery_schema_history`, so re-running is a no-op.

use rusqlite::Connection;
use tracing::info;

use crate::Result;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Latest schema version known to this build.
pub fn latest_version() -> u32 {
    embedded::migrations::runner()
        .get_migrations()
        .iter()
        .map(|m| version_of(m.version()))
        .max()
        .unwrap_or(0)
}

/// Highest applied version, or 0 on a fresh database.
pub fn current_version(conn: &mut Connection) -> Result<u32> {
    let tracked: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master
         WHERE type = 'table' AND name = 'refinery_schema_history')",
        [],
        |row| row.get(0),
    )?;
    if !tracked {
        return Ok(0);
    }

    let last = embedded::migrations::runner().get_last_applied_migration(conn)?;
    Ok(last.map(|m| version_of(m.version())).unwrap_or(0))
}

/// Apply every pending migration.
pub fn run(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner().run(conn)?;
    for migration in report.applied_migrations() {
        info!(version = migration.version(), name = migration.name(), "Applied migration");
    }
    Ok(())
}

fn version_of(version: impl TryInto<u32>) -> u32 {
    version.try_into().unwrap_or(0)
}
