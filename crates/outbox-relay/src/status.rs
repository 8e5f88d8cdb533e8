//! Relay status snapshots and lifecycle events.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Relay state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    /// Not holding the lease; another instance may be leading.
    #[default]
    Idle,
    AttemptingLock,
    /// Holding the lease and publishing.
    Leading,
    Stopped,
}

/// A record the relay cannot get past.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalledRecord {
    pub record_id: i64,
    pub error: String,
    /// `true` for decode failures and broker rejections, `false` while the
    /// record keeps failing transiently.
    pub permanent: bool,
    pub since: DateTime<Utc>,
    pub attempts: u32,
}

/// Point-in-time view of a relay instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub owner_id: String,
    pub lock_name: String,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_published_id: Option<i64>,
    pub published_count: u64,
    pub consecutive_failures: u32,
    /// Set after repeated store failures; cleared once a cycle completes
    /// without a store error.
    pub persistence_degraded: bool,
    pub stalled: Option<StalledRecord>,
    pub last_error: Option<String>,
}

impl RelayStatus {
    pub fn is_leading(&self) -> bool {
        self.state == RelayState::Leading
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }
}

/// Events emitted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    LeaseAcquired { expires_at: DateTime<Utc> },
    LeaseLost,
    Published {
        record_id: i64,
        topic: String,
        partition: u32,
        offset: Option<i64>,
    },
    /// A transient send failure; the record will be retried.
    SendFailed { record_id: i64, error: String },
    Stalled(StalledRecord),
    /// A previously stalled record went through.
    Recovered { record_id: i64 },
    DeadLettered { record_id: i64, topic: String },
    PersistenceDegraded { consecutive_failures: u32 },
    Stopped,
}
