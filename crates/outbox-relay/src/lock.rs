//! Named leases backed by the `outbox_lock` table.
//!
//! Acquisition, renewal and takeover are one conditional write, so two
//! processes racing for the same lock are arbitrated by the database itself.
//! A holder that crashes simply stops renewing; its lease expires and any
//! other instance may take over.

use crate::{OutboxError, OutboxResult};
use chrono::{DateTime, Utc};
use outbox_database::{queries, AsyncDatabase};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller holds the lease until `expires_at`.
    Granted { expires_at: DateTime<Utc> },
    /// Another owner holds a live lease.
    Denied,
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted { .. })
    }
}

/// The live holder of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lease manager. Cloning is cheap and shares the underlying executor.
#[derive(Clone)]
pub struct LockManager {
    db: AsyncDatabase,
}

impl LockManager {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Acquire `lock_name` for `owner_id`, or extend the lease it already holds.
    pub async fn try_acquire_or_renew(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_duration: Duration,
    ) -> OutboxResult<LockOutcome> {
        self.try_acquire_or_renew_at(lock_name, owner_id, lease_duration, Utc::now())
            .await
    }

    /// [`try_acquire_or_renew`](Self::try_acquire_or_renew) with an explicit clock.
    pub async fn try_acquire_or_renew_at(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> OutboxResult<LockOutcome> {
        if lease_duration.is_zero() {
            return Err(OutboxError::InvalidConfig(
                "lease duration must be positive".to_string(),
            ));
        }
        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|e| OutboxError::InvalidConfig(format!("lease duration out of range: {}", e)))?;

        // Stored at millisecond precision
        let now = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        let expires_at = now + lease;

        let name = lock_name.to_string();
        let owner = owner_id.to_string();
        let granted = self
            .db
            .call(move |conn| queries::try_acquire_lock(conn, &name, &owner, now, expires_at))
            .await?;

        if granted {
            debug!(lock_name, owner_id, expires_at = %expires_at, "Lease granted");
            Ok(LockOutcome::Granted { expires_at })
        } else {
            debug!(lock_name, owner_id, "Lease denied");
            Ok(LockOutcome::Denied)
        }
    }

    /// Give up the lease if `owner_id` still holds it. Returns `true` if cleared.
    pub async fn release(&self, lock_name: &str, owner_id: &str) -> OutboxResult<bool> {
        let name = lock_name.to_string();
        let owner = owner_id.to_string();
        let released = self
            .db
            .call(move |conn| queries::release_lock(conn, &name, &owner))
            .await?;

        if released {
            info!(lock_name, owner_id, "Lease released");
        }
        Ok(released)
    }

    /// The owner of a live lease on `lock_name`, if any.
    pub async fn current_holder(&self, lock_name: &str) -> OutboxResult<Option<LockHolder>> {
        let name = lock_name.to_string();
        let lock = self
            .db
            .call(move |conn| queries::get_lock(conn, &name))
            .await?;

        let now = Utc::now();
        Ok(lock.filter(|l| l.is_live(now)).and_then(|l| {
            l.owner_id.map(|owner_id| LockHolder {
                owner_id,
                acquired_at: l.acquired_at,
                expires_at: l.expires_at,
            })
        }))
    }

    pub async fn is_held_by(&self, lock_name: &str, owner_id: &str) -> OutboxResult<bool> {
        let name = lock_name.to_string();
        let owner = owner_id.to_string();
        let held = self
            .db
            .call(move |conn| queries::lock_held_by(conn, &name, &owner, Utc::now()))
            .await?;
        Ok(held)
    }
}
