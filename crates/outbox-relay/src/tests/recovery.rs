use super::*;
use crate::{OutboxStore, RelayState};
use chrono::Utc;

#[tokio::test]
async fn crashed_leader_is_replaced_and_unmarked_record_resent() {
    let db = TestDb::new();
    let store = OutboxStore::new(db.connect().await);
    let ids = enqueue_n(&store, 5, &["k"]).await;

    // A sends the third record, then dies before the acknowledgment arrives
    let producer_a = TestProducer::new();
    producer_a.hang_on(ids[2]);
    let relay_a = relay(db.connect().await, &producer_a, test_config("a"));
    let handle_a = relay_a.clone().start();

    wait_until("a sent third record", || async { producer_a.attempts().contains(&ids[2]) }).await;
    handle_a.abort();
    wait_until("a stopped", || async { handle_a.is_finished() }).await;

    let lock_after_crash = store
        .database()
        .call(|conn| queries::get_lock(conn, LOCK_NAME))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lock_after_crash.owner_id.as_deref(), Some("a"));
    assert_eq!(store.pending_count().await.unwrap(), 3);

    let producer_b = TestProducer::new();
    let relay_b = relay(db.connect().await, &producer_b, test_config("b"));
    let handle_b = relay_b.clone().start();

    wait_until("outbox drained", || async { store.pending_count().await.unwrap() == 0 }).await;

    let holder = relay_b.locks().current_holder(LOCK_NAME).await.unwrap().unwrap();
    assert_eq!(holder.owner_id, "b");
    assert!(holder.acquired_at >= lock_after_crash.expires_at);
    handle_b.shutdown().await;

    assert_eq!(producer_a.attempts(), vec![ids[0], ids[1], ids[2]]);
    assert_eq!(producer_a.delivered(TOPIC), vec![ids[0], ids[1]]);
    // Third record is delivered again; first two are not
    assert_eq!(producer_b.attempts(), vec![ids[2], ids[3], ids[4]]);
    assert_eq!(producer_b.delivered(TOPIC), vec![ids[2], ids[3], ids[4]]);
}

#[tokio::test]
async fn acknowledgment_after_lease_expiry_is_abandoned() {
    let db = TestDb::new();
    let producer = TestProducer::new();
    let store = OutboxStore::new(db.connect().await);
    let ids = enqueue_n(&store, 2, &[]).await;
    producer.hang_on(ids[0]);

    let mut config = test_config("a");
    config.lease_duration = Duration::from_millis(300);
    let relay = relay(db.connect().await, &producer, config);
    let mut events = relay.subscribe();
    let handle = relay.clone().start();

    wait_for_event(&mut events, "lease acquired", |e| matches!(e, RelayEvent::LeaseAcquired { .. })).await;
    let started = Utc::now();
    wait_for_event(&mut events, "lease lost", |e| matches!(e, RelayEvent::LeaseLost)).await;

    // The wait was cut off at lease expiry, not earlier
    assert!(Utc::now() - started >= chrono::Duration::milliseconds(150));
    let record = store.get(ids[0]).await.unwrap().unwrap();
    assert!(record.is_pending());
    assert!(!producer.attempts().contains(&ids[1]));

    producer.heal(ids[0]);
    wait_until("outbox drained", || async { store.pending_count().await.unwrap() == 0 }).await;
    handle.shutdown().await;

    assert_eq!(producer.delivered(TOPIC), ids);
}

#[tokio::test]
async fn stolen_lease_stops_publishing_mid_batch() {
    let db = TestDb::new();
    let admin = db.connect().await;
    let store = OutboxStore::new(admin.clone());
    enqueue_n(&store, 20, &[]).await;

    let producer =
        TestProducer::with_broker(InMemoryBroker::new(2).with_latency(Duration::from_millis(30)));
    let mut config = test_config("a");
    config.batch_size = 20;
    let relay = relay(db.connect().await, &producer, config);
    let mut events = relay.subscribe();
    let handle = relay.clone().start();

    wait_until("some records delivered", || async { producer.delivered(TOPIC).len() >= 3 }).await;

    // Another process takes the lock behind A's back
    admin
        .call_sqlite(|conn| {
            conn.execute(
                "UPDATE outbox_lock SET owner_id = 'intruder', expires_at_ms = ?1 WHERE lock_name = ?2",
                rusqlite::params![Utc::now().timestamp_millis() + 60_000, LOCK_NAME],
            )
        })
        .await
        .unwrap();

    wait_for_event(&mut events, "lease lost", |e| matches!(e, RelayEvent::LeaseLost)).await;
    let attempts_at_loss = producer.attempts().len();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(producer.attempts().len(), attempts_at_loss);
    assert_ne!(relay.status().await.state, RelayState::Leading);

    // Every record A marked was delivered; the rest wait for the new leader
    let pending = store.pending_count().await.unwrap() as usize;
    assert!(pending > 0);
    assert!(20 - pending <= producer.delivered(TOPIC).len());

    handle.shutdown().await;
    // A's shutdown does not disturb the intruder's lease
    let holder = relay.locks().current_holder(LOCK_NAME).await.unwrap().unwrap();
    assert_eq!(holder.owner_id, "intruder");
}

#[tokio::test]
async fn lease_lapsing_during_store_outage_drops_leadership() {
    let db = TestDb::new();
    let producer = TestProducer::new();
    let admin = db.connect().await;
    let store = OutboxStore::new(admin.clone());

    let relay = relay(db.connect().await, &producer, test_config("a"));
    let mut events = relay.subscribe();
    let handle = relay.clone().start();
    wait_until("leading", || async { relay.status().await.is_leading() }).await;
    let lease_expires_at = relay.status().await.lease_expires_at.unwrap();

    // Renewals fail from here on
    admin
        .call_sqlite(|conn| conn.execute_batch("ALTER TABLE outbox_lock RENAME TO outbox_lock_offline"))
        .await
        .unwrap();

    wait_for_event(&mut events, "lease lost", |e| matches!(e, RelayEvent::LeaseLost)).await;
    assert!(Utc::now() >= lease_expires_at);
    let status = relay.status().await;
    assert_ne!(status.state, RelayState::Leading);
    assert!(status.lease_expires_at.is_none());

    admin
        .call_sqlite(|conn| conn.execute_batch("ALTER TABLE outbox_lock_offline RENAME TO outbox_lock"))
        .await
        .unwrap();
    let ids = enqueue_n(&store, 2, &[]).await;

    wait_until("outbox drained", || async { store.pending_count().await.unwrap() == 0 }).await;
    assert!(relay.status().await.is_leading());
    handle.shutdown().await;

    assert_eq!(producer.delivered(TOPIC), ids);
}
