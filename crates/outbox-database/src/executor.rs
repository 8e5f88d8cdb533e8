//! Async SQLite executor using a dedicated background thread.
//!
//! This module provides an async-friendly interface to SQLite that:
//! - Uses a single dedicated thread for all SQLite operations
//! - Sends queries through a channel (non-blocking from caller's perspective)
//! - Keeps the Tokio runtime free for other async work
//!
//! # Design Principles
//!
//! 1. **Single writer per process**: one thread owns the connection
//! 2. **No blocking in async context**: callers await results without blocking threads
//! 3. **Predictable latency**: queries execute in FIFO order
//! 4. **DB-only operations**: only SQL runs inside `call()`. Broker sends,
//!    envelope decoding and sleeps happen outside.
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//!
//! // Business write and outbox insert commit together
//! db.transaction(|tx| {
//!     tx.execute("UPDATE orders SET state = 'placed' WHERE id = ?1", [42])?;
//!     queries::insert_outbox_record(tx, &record)?;
//!     Ok(())
//! }).await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use rusqlite::TransactionBehavior;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

// WAL mode doesn't apply to in-memory databases
const MEMORY_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
";

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Async SQLite database with a dedicated executor thread.
///
/// All operations are sent to a single background thread via channel.
/// Cloning is cheap and shares the same connection.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// This will:
    /// - Create the database file if it doesn't exist
    /// - Enable WAL mode and a busy timeout for multi-process access
    /// - Run any pending migrations
    /// - Start the dedicated executor thread
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();

        info!(path = %path_str, "Opening async database");

        let conn = Connection::open(path_str.clone())
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Self::initialize(conn, path_str, FILE_PRAGMAS).await
    }

    /// Open a private in-memory database, mainly for tests.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Self::initialize(conn, ":memory:".to_string(), MEMORY_PRAGMAS).await
    }

    async fn initialize(conn: Connection, path: String, pragmas: &'static str) -> DatabaseResult<Self> {
        conn.call(move |conn| {
            conn.execute_batch(pragmas)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let db = Self { conn, path };
        db.call(|conn| migrations::run_migrations(conn)).await?;

        info!(path = %db.path, "Async database initialized");
        Ok(db)
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread. The caller's async
    /// task is parked (not blocked) until the result is ready.
    ///
    /// Inside the closure, only run SQL and lightweight row mapping. Anything
    /// slow blocks the single DB thread and starves every other query,
    /// including lease renewals.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call_mut(move |conn| f(conn)).await
    }

    /// Execute a closure with mutable access to the connection.
    ///
    /// Needed for anything that opens a transaction.
    pub async fn call_mut<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // Our DatabaseResult<T> travels inside the tokio_rusqlite Ok variant,
        // so the closure's own errors come back untouched.
        let outer_result = self
            .conn
            .call(move |conn| Ok(f(conn)))
            .await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that returns a rusqlite::Result.
    ///
    /// Convenience method for simple queries that only produce rusqlite errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Run a closure inside a deferred transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise. This is the
    /// write path business code uses to insert outbox records together with
    /// its own changes.
    pub async fn transaction<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.transaction_with(TransactionBehavior::Deferred, f).await
    }

    /// Run a closure inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The reserved lock is taken up front, so no other connection can write
    /// between the closure's reads and its writes.
    pub async fn immediate_transaction<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.transaction_with(TransactionBehavior::Immediate, f).await
    }

    async fn transaction_with<F, T>(&self, behavior: TransactionBehavior, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call_mut(move |conn| {
            let tx = conn.transaction_with_behavior(behavior)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy by executing a simple query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the database connection.
    ///
    /// This will wait for any pending operations to complete,
    /// then shut down the executor thread.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_async_database_open() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        assert!(db.health_check().await.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("deeper").join("outbox.db");

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        assert!(db.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_shuts_down_every_clone() {
        let dir = tempdir().unwrap();
        let db = AsyncDatabase::open(&dir.path().join("outbox.db")).await.unwrap();
        let other = db.clone();

        db.close().await.unwrap();
        assert!(other.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();

        db.call_sqlite(|conn| conn.execute("CREATE TABLE t (v INTEGER)", []))
            .await
            .unwrap();

        db.transaction(|tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            tx.execute("INSERT INTO t (v) VALUES (2)", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = db
            .call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_err() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();

        db.call_sqlite(|conn| conn.execute("CREATE TABLE t (v INTEGER)", []))
            .await
            .unwrap();

        let result: DatabaseResult<()> = db
            .transaction(|tx| {
                tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
                Err(DatabaseError::InvalidData("business rule violated".to_string()))
            })
            .await;
        assert!(matches!(result, Err(DatabaseError::InvalidData(_))));

        let count: i64 = db
            .call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_queries() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_concurrent.db");

        let db = AsyncDatabase::open(&db_path).await.unwrap();

        db.call_sqlite(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS counter (id INTEGER PRIMARY KEY, val INTEGER);
                 INSERT INTO counter (val) VALUES (0);",
            )
        })
        .await
        .unwrap();

        let mut handles = vec![];
        for _ in 0..10 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.call_sqlite(|conn| {
                    conn.execute("UPDATE counter SET val = val + 1 WHERE id = 1", [])
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let count: i32 = db
            .call(|conn| {
                conn.query_row("SELECT val FROM counter WHERE id = 1", [], |row| row.get(0))
                    .map_err(DatabaseError::from)
            })
            .await
            .unwrap();

        assert_eq!(count, 10);
    }
}
