//! SQLite storage layer for the outbox relay.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Schema migrations for the outbox and lock tables
//! - Row model types
//! - Query functions, including the conditional write behind the relay lease
//!
//! # Architecture
//!
//! The `AsyncDatabase` uses a single dedicated thread for all SQLite operations.
//! Queries are sent through a channel and executed in FIFO order.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let pending = db.call(|conn| queries::pending_summary(conn)).await?;
//! ```
//!
//! Several processes may open the same database file; SQLite file locking
//! (WAL mode plus a busy timeout) arbitrates between them.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
