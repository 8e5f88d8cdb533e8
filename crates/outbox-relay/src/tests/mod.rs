//! Relay scenario tests.
//!
//! These run real relays against on-disk SQLite files with short leases,
//! so competing instances use separate connections exactly as separate
//! processes would.

mod recovery;

use crate::{
    OutboxMessage, OutboxRelay, OutboxStore, PoisonPolicy, RelayConfig, RelayEvent,
    ORIGINAL_TOPIC_HEADER, SEQUENCE_HEADER,
};
use async_trait::async_trait;
use broker_producer::{
    Acknowledgment, BrokerError, BrokerProducer, BrokerResult, InMemoryBroker, ProducerRecord,
};
use outbox_database::{queries, AsyncDatabase, NewOutboxRecord};
use outbox_envelope::Envelope;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub(crate) const LOCK_NAME: &str = "test-relay";
pub(crate) const TOPIC: &str = "orders";
const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// A database file shared by several connections.
pub(crate) struct TestDb {
    _dir: TempDir,
    path: PathBuf,
}

impl TestDb {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        Self { _dir: dir, path }
    }

    /// A new connection, as another process would open.
    pub(crate) async fn connect(&self) -> AsyncDatabase {
        AsyncDatabase::open(&self.path).await.unwrap()
    }
}

pub(crate) fn test_config(owner_id: &str) -> RelayConfig {
    RelayConfig {
        lock_name: LOCK_NAME.to_string(),
        owner_id: owner_id.to_string(),
        lease_duration: Duration::from_millis(500),
        batch_size: 10,
        poll_interval: Duration::from_millis(20),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        persistence_failure_threshold: 3,
        event_source: Some("orders-service".to_string()),
        poison_policy: PoisonPolicy::Block,
    }
}

pub(crate) fn relay(
    db: AsyncDatabase,
    producer: &Arc<TestProducer>,
    config: RelayConfig,
) -> Arc<OutboxRelay<Arc<TestProducer>>> {
    Arc::new(OutboxRelay::new(db, producer.clone(), config).unwrap())
}

/// Enqueue `n` messages with keys cycling over `keys` (unkeyed if empty).
pub(crate) async fn enqueue_n(store: &OutboxStore, n: usize, keys: &[&str]) -> Vec<i64> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let key = if keys.is_empty() {
            None
        } else {
            Some(keys[i % keys.len()].as_bytes().to_vec())
        };
        let envelope = Envelope::new(key, format!("payload-{}", i).into_bytes());
        let record = store
            .enqueue(OutboxMessage::new(TOPIC, envelope))
            .await
            .unwrap();
        ids.push(record.id);
    }
    ids
}

/// Insert a record whose value is not an envelope.
pub(crate) async fn insert_garbage(db: &AsyncDatabase) -> i64 {
    db.call(|conn| {
        queries::insert_outbox_record(
            conn,
            &NewOutboxRecord {
                topic: TOPIC.to_string(),
                key: None,
                value: b"not an envelope".to_vec(),
                headers: vec![],
            },
        )
    })
    .await
    .unwrap()
    .id
}

pub(crate) fn sequence_of(record: &ProducerRecord) -> i64 {
    let bytes: [u8; 8] = record
        .header(SEQUENCE_HEADER)
        .expect("x-sequence header")
        .try_into()
        .expect("8-byte sequence");
    i64::from_be_bytes(bytes)
}

/// Poll `check` until it returns true, failing the test after a while.
pub(crate) async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive events until one matches.
pub(crate) async fn wait_for_event<F>(rx: &mut broadcast::Receiver<RelayEvent>, what: &str, matches: F) -> RelayEvent
where
    F: Fn(&RelayEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("timed out waiting for event {}", what))
}

/// Drain whatever events are buffered.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

#[derive(Debug, Clone)]
enum Script {
    /// Never acknowledge.
    Hang,
    Reject,
    /// Fail transiently this many more times.
    Flaky(u32),
}

enum Action {
    Hang,
    Reject,
    Fail,
    Deliver,
}

/// Producer with per-record scripted behavior over an in-memory broker.
///
/// Scripts apply to records on their original topic only, never to
/// dead-letter copies.
pub(crate) struct TestProducer {
    broker: InMemoryBroker,
    scripts: Mutex<HashMap<i64, Script>>,
    attempts: Mutex<Vec<i64>>,
}

impl TestProducer {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_broker(InMemoryBroker::new(4))
    }

    pub(crate) fn with_broker(broker: InMemoryBroker) -> Arc<Self> {
        Arc::new(Self {
            broker,
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn hang_on(&self, record_id: i64) {
        self.scripts.lock().unwrap().insert(record_id, Script::Hang);
    }

    pub(crate) fn reject(&self, record_id: i64) {
        self.scripts.lock().unwrap().insert(record_id, Script::Reject);
    }

    pub(crate) fn flaky(&self, record_id: i64, failures: u32) {
        self.scripts
            .lock()
            .unwrap()
            .insert(record_id, Script::Flaky(failures));
    }

    pub(crate) fn heal(&self, record_id: i64) {
        self.scripts.lock().unwrap().remove(&record_id);
    }

    /// Sequence of every send attempt, in order.
    pub(crate) fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().unwrap().clone()
    }

    /// Sequence of every acknowledged record on `topic`, in order.
    pub(crate) fn delivered(&self, topic: &str) -> Vec<i64> {
        self.broker
            .sent()
            .iter()
            .filter(|s| s.record.topic == topic)
            .map(|s| sequence_of(&s.record))
            .collect()
    }

    pub(crate) fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerProducer for TestProducer {
    async fn send(&self, record: ProducerRecord) -> BrokerResult<Acknowledgment> {
        let sequence = sequence_of(&record);
        self.attempts.lock().unwrap().push(sequence);

        let action = if record.header(ORIGINAL_TOPIC_HEADER).is_some() {
            Action::Deliver
        } else {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&sequence) {
                Some(Script::Hang) => Action::Hang,
                Some(Script::Reject) => Action::Reject,
                Some(Script::Flaky(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Action::Fail
                }
                _ => Action::Deliver,
            }
        };

        match action {
            Action::Hang => std::future::pending::<BrokerResult<Acknowledgment>>().await,
            Action::Reject => Err(BrokerError::Permanent("record rejected".to_string())),
            Action::Fail => Err(BrokerError::Transient("broker unavailable".to_string())),
            Action::Deliver => self.broker.send(record).await,
        }
    }
}
