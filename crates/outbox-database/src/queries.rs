//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so they run
//! equally on a plain connection, inside `AsyncDatabase::call`, or on a
//! caller-owned `rusqlite::Transaction` (which derefs to `Connection`).

use crate::{
    DatabaseError, DatabaseResult, MarkOutcome, NewOutboxRecord, OutboxLock, OutboxRecord,
    PendingSummary,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

// ==========================================
// Outbox records
// ==========================================

const RECORD_COLUMNS: &str = "id, created_at, topic, key, value, headers, processed_at";

/// Insert a new pending record. The caller owns the transaction boundary.
pub fn insert_outbox_record(conn: &Connection, record: &NewOutboxRecord) -> DatabaseResult<OutboxRecord> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO outbox_records (created_at, topic, key, value, headers)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            format_datetime(now),
            record.topic,
            record.key,
            record.value,
            record.headers,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, topic = %record.topic, "Inserted outbox record");

    get_outbox_record(conn, id)?
        .ok_or_else(|| DatabaseError::NotFound(format!("outbox record {} after insert", id)))
}

/// Get a record by id.
pub fn get_outbox_record(conn: &Connection, id: i64) -> DatabaseResult<Option<OutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox_records WHERE id = ?1",
        RECORD_COLUMNS
    ))?;
    let record = stmt.query_row(params![id], map_outbox_record).optional()?;
    Ok(record)
}

/// Up to `limit` pending records in ascending id order.
pub fn fetch_pending_records(conn: &Connection, limit: usize) -> DatabaseResult<Vec<OutboxRecord>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox_records
         WHERE processed_at IS NULL
         ORDER BY id ASC
         LIMIT ?1",
        RECORD_COLUMNS
    ))?;

    let records = stmt
        .query_map(params![limit as i64], map_outbox_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Set `processed_at` on a pending record.
///
/// Returns `false` when the record was already processed or does not exist;
/// a processed record is never touched again.
pub fn mark_record_processed(
    conn: &Connection,
    id: i64,
    processed_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let changed = conn.execute(
        "UPDATE outbox_records SET processed_at = ?2
         WHERE id = ?1 AND processed_at IS NULL",
        params![id, format_datetime(processed_at)],
    )?;
    Ok(changed == 1)
}

/// Mark a record processed only while `owner_id` holds a live lease on `lock_name`.
///
/// Run this inside an immediate transaction so the ownership check and the
/// update see the same lock row.
pub fn mark_record_processed_if_lock_held(
    conn: &Connection,
    id: i64,
    processed_at: DateTime<Utc>,
    lock_name: &str,
    owner_id: &str,
) -> DatabaseResult<MarkOutcome> {
    if !lock_held_by(conn, lock_name, owner_id, processed_at)? {
        return Ok(MarkOutcome::LeaseNotHeld);
    }
    if mark_record_processed(conn, id, processed_at)? {
        Ok(MarkOutcome::Marked)
    } else {
        Ok(MarkOutcome::AlreadyProcessed)
    }
}

/// Backlog size, oldest pending record and the most recent processed id.
pub fn pending_summary(conn: &Connection) -> DatabaseResult<PendingSummary> {
    let (pending, oldest_pending_id): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MIN(id) FROM outbox_records WHERE processed_at IS NULL",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let oldest_pending_created_at = match oldest_pending_id {
        Some(id) => get_outbox_record(conn, id)?.map(|r| r.created_at),
        None => None,
    };

    let last_processed_id: Option<i64> = conn.query_row(
        "SELECT MAX(id) FROM outbox_records WHERE processed_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?;

    Ok(PendingSummary {
        pending,
        oldest_pending_id,
        oldest_pending_created_at,
        last_processed_id,
    })
}

fn map_outbox_record(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    Ok(OutboxRecord {
        id: row.get(0)?,
        created_at: parse_datetime(1, row.get::<_, String>(1)?)?,
        topic: row.get(2)?,
        key: row.get(3)?,
        value: row.get(4)?,
        headers: row.get(5)?,
        processed_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_datetime(6, s))
            .transpose()?,
    })
}

// ==========================================
// Outbox lock
// ==========================================

/// Grant or renew the lease on `lock_name` for `owner_id` in a single write.
///
/// The row is written when it does not exist, when it is released or expired
/// (`expires_at_ms <= now`), or when `owner_id` already owns it. Renewal keeps
/// the original `acquired_at_ms`. Returns `true` when the lease was granted.
pub fn try_acquire_lock(
    conn: &Connection,
    lock_name: &str,
    owner_id: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let changed = conn.execute(
        "INSERT INTO outbox_lock (lock_name, owner_id, acquired_at_ms, expires_at_ms)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(lock_name) DO UPDATE SET
             acquired_at_ms = CASE
                 WHEN outbox_lock.owner_id = excluded.owner_id
                      AND outbox_lock.expires_at_ms > excluded.acquired_at_ms
                 THEN outbox_lock.acquired_at_ms
                 ELSE excluded.acquired_at_ms
             END,
             owner_id = excluded.owner_id,
             expires_at_ms = excluded.expires_at_ms
         WHERE outbox_lock.owner_id IS NULL
            OR outbox_lock.owner_id = excluded.owner_id
            OR outbox_lock.expires_at_ms <= excluded.acquired_at_ms",
        params![
            lock_name,
            owner_id,
            now.timestamp_millis(),
            expires_at.timestamp_millis()
        ],
    )?;
    Ok(changed == 1)
}

/// Clear ownership if `owner_id` still holds the lock. Returns `true` if cleared.
pub fn release_lock(conn: &Connection, lock_name: &str, owner_id: &str) -> DatabaseResult<bool> {
    let changed = conn.execute(
        "UPDATE outbox_lock SET owner_id = NULL, expires_at_ms = 0
         WHERE lock_name = ?1 AND owner_id = ?2",
        params![lock_name, owner_id],
    )?;
    Ok(changed == 1)
}

/// Get the lock row, if it was ever acquired.
pub fn get_lock(conn: &Connection, lock_name: &str) -> DatabaseResult<Option<OutboxLock>> {
    let mut stmt = conn.prepare_cached(
        "SELECT lock_name, owner_id, acquired_at_ms, expires_at_ms
         FROM outbox_lock WHERE lock_name = ?1",
    )?;
    let lock = stmt
        .query_row(params![lock_name], |row| {
            Ok(OutboxLock {
                lock_name: row.get(0)?,
                owner_id: row.get(1)?,
                acquired_at: millis_to_datetime(2, row.get(2)?)?,
                expires_at: millis_to_datetime(3, row.get(3)?)?,
            })
        })
        .optional()?;
    Ok(lock)
}

/// Whether `owner_id` holds a lease on `lock_name` that is live at `now`.
pub fn lock_held_by(
    conn: &Connection,
    lock_name: &str,
    owner_id: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let held: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox_lock
         WHERE lock_name = ?1 AND owner_id = ?2 AND expires_at_ms > ?3",
        params![lock_name, owner_id, now.timestamp_millis()],
        |row| row.get(0),
    )?;
    Ok(held == 1)
}

// ==========================================
// Helpers
// ==========================================

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(column: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn millis_to_datetime(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}
