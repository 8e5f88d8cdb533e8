//! Row types for the outbox and lock tables.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A pending or processed outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    pub key: Option<Vec<u8>>,
    /// Encoded envelope value frame.
    pub value: Vec<u8>,
    /// Encoded envelope header frame. Empty means no headers.
    pub headers: Vec<u8>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}

/// New outbox row for insertion. The id is assigned by the database.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<u8>,
}

/// Current state of a named lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxLock {
    pub lock_name: String,
    /// `None` after an orderly release.
    pub owner_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OutboxLock {
    /// Whether some owner holds a lease that has not yet expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.owner_id.is_some() && self.expires_at > now
    }

    /// Whether `owner_id` holds a lease that has not yet expired.
    pub fn is_held_by(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        self.owner_id.as_deref() == Some(owner_id) && self.expires_at > now
    }
}

/// Backlog summary used for status and lag monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub pending: i64,
    pub oldest_pending_id: Option<i64>,
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
    pub last_processed_id: Option<i64>,
}

/// Result of a lease-guarded mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The record moved from pending to processed.
    Marked,
    /// The record was already processed (or does not exist); nothing changed.
    AlreadyProcessed,
    /// The caller no longer holds the lease; nothing changed.
    LeaseNotHeld,
}
