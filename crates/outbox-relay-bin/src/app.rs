//! Command implementations.

use crate::settings;
use broker_producer::RestProxyProducer;
use chrono::Utc;
use outbox_config_and_utils::{Config, Paths};
use outbox_database::{queries, AsyncDatabase};
use outbox_envelope::Envelope;
use outbox_relay::{LockManager, OutboxMessage, OutboxRelay, OutboxStore};
use std::error::Error;
use std::sync::Arc;
use tracing::info;

type CommandResult = Result<(), Box<dyn Error>>;

async fn open_database(config: &Config, paths: &Paths) -> Result<AsyncDatabase, Box<dyn Error>> {
    Ok(AsyncDatabase::open(&config.database_path(paths)).await?)
}

/// Run the relay until Ctrl-C, then release the lease and exit.
pub async fn run_relay(config: &Config, paths: &Paths) -> CommandResult {
    let db = open_database(config, paths).await?;
    db.health_check().await?;
    let producer = RestProxyProducer::new(settings::rest_proxy_config(&config.broker))?;
    let relay = Arc::new(OutboxRelay::new(db, producer, settings::relay_config(config))?);

    info!(
        owner_id = %relay.config().owner_id,
        lock_name = %relay.config().lock_name,
        database = %config.database_path(paths).display(),
        broker = %config.broker.rest_proxy_url,
        "Outbox relay starting"
    );
    let handle = relay.clone().start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;

    let status = relay.status().await;
    info!(
        published = status.published_count,
        last_published_id = ?status.last_published_id,
        "Outbox relay stopped"
    );
    Ok(())
}

/// Print the backlog and the lock holder.
pub async fn check_status(config: &Config, paths: &Paths, json: bool) -> CommandResult {
    let db = open_database(config, paths).await?;
    let store = OutboxStore::new(db.clone());
    let locks = LockManager::new(db.clone());

    let summary = store.summary().await?;
    let oldest = store.oldest_pending().await?;
    let holder = locks.current_holder(&config.relay.lock_name).await?;
    db.close().await?;

    if json {
        let report = serde_json::json!({
            "lock_name": config.relay.lock_name,
            "pending": summary.pending,
            "last_processed_id": summary.last_processed_id,
            "oldest_pending": oldest,
            "lock_holder": holder,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Outbox");
    println!("  Pending:        {}", summary.pending);
    match &oldest {
        Some(oldest) => println!(
            "  Oldest pending: #{} ({} ms old)",
            oldest.id, oldest.age_ms
        ),
        None => println!("  Oldest pending: -"),
    }
    match summary.last_processed_id {
        Some(id) => println!("  Last processed: #{}", id),
        None => println!("  Last processed: -"),
    }
    println!("Lock '{}'", config.relay.lock_name);
    match holder {
        Some(holder) => {
            println!("  Holder:  {}", holder.owner_id);
            println!("  Since:   {}", holder.acquired_at.to_rfc3339());
            println!(
                "  Expires: {} (in {} ms)",
                holder.expires_at.to_rfc3339(),
                (holder.expires_at - Utc::now()).num_milliseconds().max(0)
            );
        }
        None => println!("  Holder:  none"),
    }
    Ok(())
}

/// Write one record in its own transaction.
pub async fn enqueue(
    config: &Config,
    paths: &Paths,
    topic: String,
    key: Option<String>,
    payload: String,
    headers: &[String],
) -> CommandResult {
    let mut envelope = Envelope::new(key.map(String::into_bytes), payload.into_bytes());
    for arg in headers {
        let (name, value) = settings::parse_header(arg)?;
        envelope = envelope.with_header(name, value);
    }

    let db = open_database(config, paths).await?;
    let store = OutboxStore::new(db.clone());
    let record = store.enqueue(OutboxMessage::new(topic, envelope)).await?;
    db.close().await?;

    println!("Enqueued record #{} on '{}'", record.id, record.topic);
    Ok(())
}

/// Clear the relay lock for an owner.
///
/// Without `--owner`, the configured owner is used, then whoever holds the
/// row, expired or not.
pub async fn release_lock(config: &Config, paths: &Paths, owner: Option<String>) -> CommandResult {
    let db = open_database(config, paths).await?;
    let lock_name = config.relay.lock_name.clone();

    let owner = match owner.or_else(|| config.relay.owner_id.clone()) {
        Some(owner) => Some(owner),
        None => {
            let name = lock_name.clone();
            db.call(move |conn| queries::get_lock(conn, &name))
                .await?
                .and_then(|lock| lock.owner_id)
        }
    };
    let Some(owner) = owner else {
        db.close().await?;
        println!("Lock '{}' is not held", lock_name);
        return Ok(());
    };

    let released = LockManager::new(db.clone()).release(&lock_name, &owner).await?;
    db.close().await?;
    if released {
        println!("Released lock '{}' held by {}", lock_name, owner);
    } else {
        println!("Lock '{}' is not held by {}", lock_name, owner);
    }
    Ok(())
}
