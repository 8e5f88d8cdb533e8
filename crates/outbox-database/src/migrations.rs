//! Database migrations.
//!
//! This module contains all SQL migrations for the database schema.
//! Migrations are run in order and tracked in the `migrations` table.

use crate::{DatabaseError, DatabaseResult};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
///
/// Safe to call from several processes at once: the version check and the
/// migrations themselves run inside one immediate transaction.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute_batch("BEGIN IMMEDIATE")?;
    match apply_pending(conn) {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn apply_pending(conn: &Connection) -> DatabaseResult<()> {
    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version > CURRENT_VERSION {
        return Err(DatabaseError::Migration(format!(
            "database schema v{} is newer than this build (v{})",
            current_version, CURRENT_VERSION
        )));
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_records(conn)?;
    }
    if current_version < 2 {
        migrate_v2_outbox_lock(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Outbox records.
///
/// AUTOINCREMENT guarantees ids are never reused, so `id` order stays the
/// publish order even after rows are removed by external housekeeping.
fn migrate_v1_outbox_records(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox records");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            topic TEXT NOT NULL,
            key BLOB,
            value BLOB NOT NULL,
            headers BLOB NOT NULL DEFAULT x'',
            processed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_records_pending
            ON outbox_records(id) WHERE processed_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_outbox_records_created_at
            ON outbox_records(created_at);
        ",
    )?;

    record_migration(conn, 1, "outbox_records")?;
    Ok(())
}

/// V2: Named relay lease.
///
/// Timestamps are epoch millis so expiry checks compare numbers inside
/// the conditional write.
fn migrate_v2_outbox_lock(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: outbox lock");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_lock (
            lock_name TEXT PRIMARY KEY,
            owner_id TEXT,
            acquired_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        ",
    )?;

    record_migration(conn, 2, "outbox_lock")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert!(table_exists(&conn, "outbox_records"));
        assert!(table_exists(&conn, "outbox_lock"));

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_VERSION as i64);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO migrations (version, name) VALUES (?1, 'from_the_future')",
            [CURRENT_VERSION + 1],
        )
        .unwrap();

        let result = run_migrations(&conn);
        assert!(matches!(result, Err(DatabaseError::Migration(_))));
    }
}
