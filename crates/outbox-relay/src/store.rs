//! Outbox store: the transactional write path and the relay's read/mark path.

use crate::{OutboxError, OutboxResult};
use chrono::{DateTime, Utc};
use outbox_database::{queries, AsyncDatabase, MarkOutcome, NewOutboxRecord, OutboxRecord, PendingSummary};
use outbox_envelope::{encode, Envelope};
use rusqlite::Transaction;
use serde::Serialize;
use tracing::{debug, trace};

/// A message to append to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub topic: String,
    pub envelope: Envelope,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            topic: topic.into(),
            envelope,
        }
    }
}

/// The oldest record still waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OldestPending {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    /// Time since insertion, in milliseconds. This is the relay lag.
    pub age_ms: i64,
}

/// Outbox table access.
///
/// Cloning is cheap and shares the underlying executor.
#[derive(Clone)]
pub struct OutboxStore {
    db: AsyncDatabase,
}

impl OutboxStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }

    /// Append a pending record inside the caller's ongoing transaction.
    ///
    /// The store never commits: the record becomes visible exactly when the
    /// caller's business changes do, and disappears with them on rollback.
    pub fn insert(tx: &Transaction<'_>, message: &OutboxMessage) -> OutboxResult<OutboxRecord> {
        if message.topic.trim().is_empty() {
            return Err(OutboxError::InvalidMessage("topic must not be empty".to_string()));
        }

        let encoded = encode(&message.envelope);
        let record = queries::insert_outbox_record(
            tx,
            &NewOutboxRecord {
                topic: message.topic.clone(),
                key: encoded.key,
                value: encoded.value,
                headers: encoded.headers,
            },
        )?;

        trace!(record_id = record.id, topic = %record.topic, "Outbox record staged");
        Ok(record)
    }

    /// Run `f` in one transaction on the database thread.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. Business writes
    /// and [`insert`](Self::insert) calls inside `f` commit or vanish together.
    pub async fn transaction<F, T>(&self, f: F) -> OutboxResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> OutboxResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.db
            .call_mut(move |conn| {
                let tx = conn.transaction()?;
                match f(&tx) {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(Ok(value))
                    }
                    // Dropping the transaction rolls it back
                    Err(e) => Ok(Err(e)),
                }
            })
            .await?
    }

    /// Append a single message in its own transaction.
    pub async fn enqueue(&self, message: OutboxMessage) -> OutboxResult<OutboxRecord> {
        let record = self
            .transaction(move |tx| Self::insert(tx, &message))
            .await?;
        debug!(record_id = record.id, topic = %record.topic, "Outbox record enqueued");
        Ok(record)
    }

    /// Up to `limit` pending records in ascending id order.
    ///
    /// The read does not claim the rows: another process may read them a
    /// moment later. Exclusive publishing comes from the lease, and
    /// [`mark_processed_while_holding`](Self::mark_processed_while_holding)
    /// refuses to mark once it is gone. The `BEGIN IMMEDIATE` only orders the
    /// read after any write in progress.
    pub async fn fetch_pending_batch(&self, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let batch = self
            .db
            .immediate_transaction(move |tx| queries::fetch_pending_records(tx, limit))
            .await?;
        Ok(batch)
    }

    /// Mark a record processed. Returns `false` if it already was.
    pub async fn mark_processed(&self, id: i64, processed_at: DateTime<Utc>) -> OutboxResult<bool> {
        let marked = self
            .db
            .call(move |conn| queries::mark_record_processed(conn, id, processed_at))
            .await?;
        Ok(marked)
    }

    /// Mark a record processed only while `owner_id` still holds `lock_name`.
    ///
    /// The lease check and the update share one immediate transaction, so a
    /// competitor cannot take the lease between them.
    pub async fn mark_processed_while_holding(
        &self,
        id: i64,
        processed_at: DateTime<Utc>,
        lock_name: &str,
        owner_id: &str,
    ) -> OutboxResult<MarkOutcome> {
        let lock_name = lock_name.to_string();
        let owner_id = owner_id.to_string();
        let outcome = self
            .db
            .immediate_transaction(move |tx| {
                queries::mark_record_processed_if_lock_held(tx, id, processed_at, &lock_name, &owner_id)
            })
            .await?;
        Ok(outcome)
    }

    pub async fn get(&self, id: i64) -> OutboxResult<Option<OutboxRecord>> {
        let record = self
            .db
            .call(move |conn| queries::get_outbox_record(conn, id))
            .await?;
        Ok(record)
    }

    pub async fn summary(&self) -> OutboxResult<PendingSummary> {
        Ok(self.db.call(queries::pending_summary).await?)
    }

    pub async fn pending_count(&self) -> OutboxResult<i64> {
        Ok(self.summary().await?.pending)
    }

    pub async fn oldest_pending(&self) -> OutboxResult<Option<OldestPending>> {
        let summary = self.summary().await?;
        let now = Utc::now();
        Ok(summary
            .oldest_pending_id
            .zip(summary.oldest_pending_created_at)
            .map(|(id, created_at)| OldestPending {
                id,
                created_at,
                age_ms: (now - created_at).num_milliseconds().max(0),
            }))
    }
}
