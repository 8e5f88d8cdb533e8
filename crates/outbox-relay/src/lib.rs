//! Transactional outbox relay.
//!
//! This crate provides:
//! - `OutboxStore`: write path for business transactions and the relay's read/mark path
//! - `LockManager`: named leases that elect a single active publisher
//! - `OutboxRelay`: the poll, publish and mark loop with ordered, at-least-once delivery
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(&path).await?;
//!
//! // Business write and outbox insert in one transaction
//! let store = OutboxStore::new(db.clone());
//! store.transaction(|tx| {
//!     tx.execute("UPDATE orders SET state = 'placed' WHERE id = ?1", [42])?;
//!     OutboxStore::insert(tx, &OutboxMessage::new("orders", envelope))?;
//!     Ok(())
//! }).await?;
//!
//! // Relay, in every instance of the service
//! let relay = Arc::new(OutboxRelay::new(db, producer, RelayConfig::default())?);
//! let handle = relay.start();
//! ```

mod backoff;
mod error;
mod lock;
mod relay;
mod status;
mod store;

#[cfg(test)]
mod tests;

pub use backoff::compute_backoff;
pub use error::{OutboxError, OutboxResult};
pub use lock::{LockHolder, LockManager, LockOutcome};
pub use relay::{OutboxRelay, PoisonPolicy, RelayConfig, RelayHandle};
pub use status::{RelayEvent, RelayState, RelayStatus, StalledRecord};
pub use store::{OldestPending, OutboxMessage, OutboxStore};

/// Header carrying the outbox record id as 8 big-endian bytes.
pub const SEQUENCE_HEADER: &str = "x-sequence";
/// Header carrying the configured event source.
pub const SOURCE_HEADER: &str = "x-source";
/// Dead-letter header naming the topic the record was meant for.
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";
/// Dead-letter header describing why the record could not be published.
pub const EXCEPTION_MESSAGE_HEADER: &str = "x-exception-message";
