//! The relay loop: hold the lease, publish pending records in id order,
//! mark each one after the broker acknowledges it.
//!
//! # State machine
//!
//! ```text
//! Idle ──▶ AttemptingLock ──granted──▶ Leading ──lease lost──▶ Idle
//!                 │                       │
//!                 └──────denied───────▶ Idle
//! ```
//!
//! While leading, every cycle renews the lease, reads a batch and walks it in
//! order. A record is only marked processed after its acknowledgment, and a
//! failure stops the batch at that record, so nothing later is confirmed
//! while an earlier record is outstanding. Lease ownership is re-checked
//! before every send and again (atomically) when marking.

use crate::{
    compute_backoff, LockManager, LockOutcome, OutboxError, OutboxResult, OutboxStore, RelayEvent,
    RelayState, RelayStatus, StalledRecord, EXCEPTION_MESSAGE_HEADER, ORIGINAL_TOPIC_HEADER,
    SEQUENCE_HEADER, SOURCE_HEADER,
};
use broker_producer::{Acknowledgment, BrokerProducer, Header, ProducerRecord};
use chrono::{DateTime, Utc};
use outbox_database::{AsyncDatabase, MarkOutcome, OutboxRecord};
use outbox_envelope::decode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What to do with a record that can never be published as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Stop at the record and keep retrying it at backoff. Status reports
    /// the stall until the record goes through or is handled externally.
    #[default]
    Block,
    /// Forward the raw record to `topic`, mark it processed and move on.
    DeadLetter { topic: String },
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name of the lease shared by all competing instances.
    pub lock_name: String,
    /// Unique identity of this instance.
    pub owner_id: String,
    pub lease_duration: Duration,
    /// Maximum records read per cycle.
    pub batch_size: usize,
    /// Wait between cycles when the outbox is empty or the lease is held elsewhere.
    pub poll_interval: Duration,
    /// Base duration for exponential backoff on failures.
    pub backoff_base: Duration,
    /// Maximum duration for backoff (caps exponential growth).
    pub backoff_max: Duration,
    /// Consecutive store failures before the relay reports itself degraded.
    pub persistence_failure_threshold: u32,
    /// Value of the `x-source` header, if set.
    pub event_source: Option<String>,
    pub poison_policy: PoisonPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lock_name: "outbox-relay".to_string(),
            owner_id: Uuid::new_v4().to_string(),
            lease_duration: Duration::from_secs(30),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            persistence_failure_threshold: 5,
            event_source: None,
            poison_policy: PoisonPolicy::Block,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> OutboxResult<()> {
        let invalid = |msg: &str| Err(OutboxError::InvalidConfig(msg.to_string()));

        if self.lock_name.trim().is_empty() {
            return invalid("lock name must not be empty");
        }
        if self.owner_id.trim().is_empty() {
            return invalid("owner id must not be empty");
        }
        if self.lease_duration.is_zero() {
            return invalid("lease duration must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive");
        }
        if self.poll_interval >= self.lease_duration {
            return invalid("poll interval must be shorter than the lease duration");
        }
        if self.backoff_base > self.backoff_max {
            return invalid("backoff base must not exceed backoff max");
        }
        if self.persistence_failure_threshold == 0 {
            return invalid("persistence failure threshold must be positive");
        }
        if let PoisonPolicy::DeadLetter { topic } = &self.poison_policy {
            if topic.trim().is_empty() {
                return invalid("dead-letter topic must not be empty");
            }
        }
        Ok(())
    }
}

/// Per-run bookkeeping, owned by the loop.
#[derive(Debug, Default)]
struct LoopState {
    /// Expiry of the lease this instance believes it holds.
    lease_expires_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    persistence_failures: u32,
}

/// When to start the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Immediately,
    Poll,
    Backoff,
}

/// Outbox relay.
pub struct OutboxRelay<P> {
    config: RelayConfig,
    store: OutboxStore,
    locks: LockManager,
    producer: P,
    status: RwLock<RelayStatus>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl<P: BrokerProducer + 'static> OutboxRelay<P> {
    /// Create a relay over `db` publishing through `producer`.
    pub fn new(db: AsyncDatabase, producer: P, config: RelayConfig) -> OutboxResult<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let status = RelayStatus {
            owner_id: config.owner_id.clone(),
            lock_name: config.lock_name.clone(),
            ..Default::default()
        };

        Ok(Self {
            store: OutboxStore::new(db.clone()),
            locks: LockManager::new(db),
            config,
            producer,
            status: RwLock::new(status),
            event_tx,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Subscribe to relay events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    /// Current status snapshot.
    pub async fn status(&self) -> RelayStatus {
        self.status.read().await.clone()
    }

    /// Spawn the loop on the Tokio runtime.
    pub fn start(self: Arc<Self>) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        RelayHandle { shutdown_tx, task }
    }

    /// Run the loop until `shutdown` fires or its sender is dropped.
    ///
    /// Errors never escape: each one is logged, reflected in the status and
    /// answered with a wait before the next cycle. On exit the lease is
    /// released so a standby instance can take over at once.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            lock_name = %self.config.lock_name,
            owner_id = %self.config.owner_id,
            batch_size = self.config.batch_size,
            lease_ms = self.config.lease_duration.as_millis() as u64,
            "Outbox relay starting"
        );

        let mut state = LoopState::default();
        loop {
            let delay = match self.cycle(&mut state).await {
                Next::Immediately => Duration::ZERO,
                Next::Poll => self.config.poll_interval,
                Next::Backoff => compute_backoff(
                    state.consecutive_failures,
                    self.config.backoff_base,
                    self.config.backoff_max,
                ),
            };

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.stop(&mut state).await;
    }

    async fn cycle(&self, state: &mut LoopState) -> Next {
        if state.lease_expires_at.is_none() {
            self.status.write().await.state = RelayState::AttemptingLock;
        }

        match self
            .locks
            .try_acquire_or_renew(&self.config.lock_name, &self.config.owner_id, self.config.lease_duration)
            .await
        {
            Ok(LockOutcome::Granted { expires_at }) => self.on_granted(state, expires_at).await,
            Ok(LockOutcome::Denied) => {
                self.on_lease_lost(state).await;
                return Next::Poll;
            }
            Err(e) => return self.on_persistence_failure(state, e).await,
        }

        let batch = match self.store.fetch_pending_batch(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => return self.on_persistence_failure(state, e).await,
        };

        if batch.is_empty() {
            self.on_persistence_ok(state).await;
            return Next::Poll;
        }
        debug!(records = batch.len(), first_id = batch[0].id, "Publishing batch");

        for record in &batch {
            if let Err(e) = self.publish(state, record).await {
                return self.on_failure(state, record, e).await;
            }
        }

        // Every mark in the batch went through
        self.on_persistence_ok(state).await;
        Next::Immediately
    }

    async fn publish(&self, state: &mut LoopState, record: &OutboxRecord) -> OutboxResult<()> {
        let expires_at = self.ensure_lease(state).await?;
        let producer_record = self.producer_record(record)?;
        let ack = self.send_within_lease(record.id, producer_record, expires_at).await?;
        self.mark(record.id).await?;
        self.on_published(state, record, ack).await;
        Ok(())
    }

    /// Check the lease before a send, renewing it once less than half remains.
    async fn ensure_lease(&self, state: &mut LoopState) -> OutboxResult<DateTime<Utc>> {
        let now = Utc::now();
        let expires_at = match state.lease_expires_at {
            Some(expires_at) if expires_at > now => expires_at,
            _ => return Err(self.lease_lost()),
        };

        let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        if remaining * 2 >= self.config.lease_duration {
            return Ok(expires_at);
        }

        match self
            .locks
            .try_acquire_or_renew(&self.config.lock_name, &self.config.owner_id, self.config.lease_duration)
            .await?
        {
            LockOutcome::Granted { expires_at } => {
                state.lease_expires_at = Some(expires_at);
                self.status.write().await.lease_expires_at = Some(expires_at);
                Ok(expires_at)
            }
            LockOutcome::Denied => Err(self.lease_lost()),
        }
    }

    /// Send and wait for the acknowledgment, but no longer than the lease.
    ///
    /// An acknowledgment arriving after expiry could race a new leader's
    /// resend of the same record, so it is abandoned as a lost lease.
    async fn send_within_lease(
        &self,
        record_id: i64,
        record: ProducerRecord,
        expires_at: DateTime<Utc>,
    ) -> OutboxResult<Acknowledgment> {
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        match tokio::time::timeout(remaining, self.producer.send(record)).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(source)) => Err(OutboxError::BrokerSend { record_id, source }),
            Err(_) => {
                warn!(record_id, "Acknowledgment not received before lease expiry");
                Err(self.lease_lost())
            }
        }
    }

    async fn mark(&self, record_id: i64) -> OutboxResult<()> {
        let outcome = self
            .store
            .mark_processed_while_holding(record_id, Utc::now(), &self.config.lock_name, &self.config.owner_id)
            .await?;

        match outcome {
            MarkOutcome::Marked => Ok(()),
            MarkOutcome::AlreadyProcessed => {
                debug!(record_id, "Record was already marked processed");
                Ok(())
            }
            MarkOutcome::LeaseNotHeld => Err(self.lease_lost()),
        }
    }

    /// Decode a stored record into what the broker receives.
    fn producer_record(&self, record: &OutboxRecord) -> OutboxResult<ProducerRecord> {
        let envelope = decode(record.key.as_deref(), &record.value, &record.headers).map_err(|source| {
            OutboxError::Decode {
                record_id: record.id,
                source,
            }
        })?;

        let metadata_headers = envelope.metadata.to_headers();
        let mut headers = envelope.headers.into_vec();
        headers.push(Header::new(SEQUENCE_HEADER, record.id.to_be_bytes().to_vec()));
        if let Some(source) = &self.config.event_source {
            headers.push(Header::new(SOURCE_HEADER, source.as_bytes()));
        }
        headers.extend(metadata_headers);

        Ok(ProducerRecord {
            topic: record.topic.clone(),
            key: envelope.key,
            value: envelope.payload,
            headers,
        })
    }

    async fn dead_letter(
        &self,
        state: &mut LoopState,
        record: &OutboxRecord,
        topic: &str,
        cause: &OutboxError,
    ) -> OutboxResult<()> {
        let expires_at = self.ensure_lease(state).await?;

        // Undecodable records travel as stored; the rest as the broker would have seen them
        let mut dead = match cause {
            OutboxError::Decode { .. } => {
                let mut headers = vec![Header::new(SEQUENCE_HEADER, record.id.to_be_bytes().to_vec())];
                if let Some(source) = &self.config.event_source {
                    headers.push(Header::new(SOURCE_HEADER, source.as_bytes()));
                }
                ProducerRecord {
                    topic: topic.to_string(),
                    key: record.key.clone(),
                    value: record.value.clone(),
                    headers,
                }
            }
            _ => ProducerRecord {
                topic: topic.to_string(),
                ..self.producer_record(record)?
            },
        };
        dead.headers.push(Header::new(ORIGINAL_TOPIC_HEADER, record.topic.as_bytes()));
        dead.headers.push(Header::new(EXCEPTION_MESSAGE_HEADER, cause.to_string().into_bytes()));

        self.send_within_lease(record.id, dead, expires_at).await?;
        self.mark(record.id).await
    }

    async fn on_granted(&self, state: &mut LoopState, expires_at: DateTime<Utc>) {
        let newly_acquired = state.lease_expires_at.is_none();
        state.lease_expires_at = Some(expires_at);
        {
            let mut status = self.status.write().await;
            status.state = RelayState::Leading;
            status.lease_expires_at = Some(expires_at);
        }

        if newly_acquired {
            info!(
                lock_name = %self.config.lock_name,
                owner_id = %self.config.owner_id,
                expires_at = %expires_at,
                "Lease acquired, leading"
            );
            self.emit(RelayEvent::LeaseAcquired { expires_at });
        }
    }

    async fn on_lease_lost(&self, state: &mut LoopState) {
        let was_leading = state.lease_expires_at.take().is_some();
        {
            let mut status = self.status.write().await;
            status.state = RelayState::Idle;
            status.lease_expires_at = None;
        }

        if was_leading {
            warn!(
                lock_name = %self.config.lock_name,
                owner_id = %self.config.owner_id,
                "Lease lost, standing by"
            );
            self.emit(RelayEvent::LeaseLost);
        }
    }

    async fn on_published(&self, state: &mut LoopState, record: &OutboxRecord, ack: Acknowledgment) {
        state.consecutive_failures = 0;

        let recovered = {
            let mut status = self.status.write().await;
            status.last_published_id = Some(record.id);
            status.published_count += 1;
            status.consecutive_failures = 0;
            status.last_error = None;
            let recovered = status
                .stalled
                .as_ref()
                .map(|s| s.record_id)
                .filter(|id| *id <= record.id);
            if recovered.is_some() {
                status.stalled = None;
            }
            recovered
        };

        debug!(
            record_id = record.id,
            topic = %ack.topic,
            partition = ack.partition,
            offset = ?ack.offset,
            "Record published"
        );

        if let Some(record_id) = recovered {
            info!(record_id, "Stalled record went through, relay recovered");
            self.emit(RelayEvent::Recovered { record_id });
        }
        self.emit(RelayEvent::Published {
            record_id: record.id,
            topic: ack.topic,
            partition: ack.partition,
            offset: ack.offset,
        });
    }

    async fn on_failure(&self, state: &mut LoopState, record: &OutboxRecord, e: OutboxError) -> Next {
        if matches!(e, OutboxError::LeaseLost { .. }) {
            self.on_lease_lost(state).await;
            Next::Poll
        } else if matches!(e, OutboxError::Persistence(_)) {
            self.on_persistence_failure(state, e).await
        } else if e.is_poison() {
            self.on_poison(state, record, e).await
        } else {
            state.consecutive_failures += 1;
            warn!(
                record_id = record.id,
                topic = %record.topic,
                attempt = state.consecutive_failures,
                error = %e,
                "Send failed, halting batch"
            );
            self.record_stall(state, record, &e, false).await;
            self.emit(RelayEvent::SendFailed {
                record_id: record.id,
                error: e.to_string(),
            });
            Next::Backoff
        }
    }

    async fn on_poison(&self, state: &mut LoopState, record: &OutboxRecord, e: OutboxError) -> Next {
        state.consecutive_failures += 1;

        if let PoisonPolicy::DeadLetter { topic } = &self.config.poison_policy {
            match self.dead_letter(state, record, topic, &e).await {
                Ok(()) => {
                    warn!(
                        record_id = record.id,
                        topic = %record.topic,
                        dead_letter_topic = %topic,
                        error = %e,
                        "Poison record moved to dead-letter topic"
                    );
                    state.consecutive_failures = 0;
                    {
                        let mut status = self.status.write().await;
                        status.consecutive_failures = 0;
                        status.last_error = Some(e.to_string());
                        if status.stalled.as_ref().map(|s| s.record_id) == Some(record.id) {
                            status.stalled = None;
                        }
                    }
                    self.emit(RelayEvent::DeadLettered {
                        record_id: record.id,
                        topic: topic.clone(),
                    });
                    return Next::Immediately;
                }
                Err(dl @ OutboxError::LeaseLost { .. }) => {
                    debug!(record_id = record.id, error = %dl, "Dead-letter abandoned");
                    self.on_lease_lost(state).await;
                    return Next::Poll;
                }
                Err(dl @ OutboxError::Persistence(_)) => {
                    return self.on_persistence_failure(state, dl).await;
                }
                Err(dl) => {
                    error!(record_id = record.id, error = %dl, "Dead-letter publish failed");
                }
            }
        }

        let (stalled, newly_permanent) = self.record_stall(state, record, &e, true).await;

        if newly_permanent {
            error!(
                record_id = record.id,
                topic = %record.topic,
                error = %e,
                "Relay stalled on a record that cannot be published"
            );
            self.emit(RelayEvent::Stalled(stalled));
        } else {
            debug!(record_id = record.id, attempts = stalled.attempts, "Still stalled");
        }
        Next::Backoff
    }

    /// Note `record` as the one the relay cannot get past.
    ///
    /// Returns the stall and whether it just became permanent.
    async fn record_stall(
        &self,
        state: &LoopState,
        record: &OutboxRecord,
        e: &OutboxError,
        permanent: bool,
    ) -> (StalledRecord, bool) {
        let mut status = self.status.write().await;
        let (stalled, was_permanent) = match status.stalled.take() {
            Some(mut previous) if previous.record_id == record.id => {
                let was_permanent = previous.permanent;
                previous.attempts += 1;
                previous.error = e.to_string();
                previous.permanent = permanent;
                (previous, was_permanent)
            }
            _ => (
                StalledRecord {
                    record_id: record.id,
                    error: e.to_string(),
                    permanent,
                    since: Utc::now(),
                    attempts: 1,
                },
                false,
            ),
        };
        status.stalled = Some(stalled.clone());
        status.consecutive_failures = state.consecutive_failures;
        status.last_error = Some(e.to_string());
        (stalled, permanent && !was_permanent)
    }

    async fn on_persistence_failure(&self, state: &mut LoopState, e: OutboxError) -> Next {
        // The store may be what kept the lease from being renewed
        if state.lease_expires_at.is_some_and(|expires_at| expires_at <= Utc::now()) {
            self.on_lease_lost(state).await;
        }

        state.persistence_failures += 1;
        state.consecutive_failures += 1;

        let newly_degraded = {
            let mut status = self.status.write().await;
            status.consecutive_failures = state.consecutive_failures;
            status.last_error = Some(e.to_string());
            if state.persistence_failures >= self.config.persistence_failure_threshold
                && !status.persistence_degraded
            {
                status.persistence_degraded = true;
                true
            } else {
                false
            }
        };

        if newly_degraded {
            error!(
                consecutive_failures = state.persistence_failures,
                error = %e,
                "Outbox store unavailable, relay degraded"
            );
            self.emit(RelayEvent::PersistenceDegraded {
                consecutive_failures: state.persistence_failures,
            });
        } else {
            warn!(
                consecutive_failures = state.persistence_failures,
                error = %e,
                "Outbox store operation failed"
            );
        }
        Next::Backoff
    }

    async fn on_persistence_ok(&self, state: &mut LoopState) {
        if state.persistence_failures == 0 {
            return;
        }
        state.persistence_failures = 0;

        let mut status = self.status.write().await;
        if status.persistence_degraded {
            status.persistence_degraded = false;
            info!("Outbox store reachable again");
        }
    }

    async fn stop(&self, state: &mut LoopState) {
        state.lease_expires_at = None;
        if let Err(e) = self
            .locks
            .release(&self.config.lock_name, &self.config.owner_id)
            .await
        {
            warn!(error = %e, "Failed to release lease on shutdown");
        }

        {
            let mut status = self.status.write().await;
            status.state = RelayState::Stopped;
            status.lease_expires_at = None;
        }
        info!(owner_id = %self.config.owner_id, "Outbox relay stopped");
        self.emit(RelayEvent::Stopped);
    }

    fn lease_lost(&self) -> OutboxError {
        OutboxError::LeaseLost {
            lock_name: self.config.lock_name.clone(),
        }
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

/// Handle to a spawned relay.
///
/// Dropping the handle also stops the loop.
pub struct RelayHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop after the current cycle, release the lease and wait for the task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Relay task failed");
            }
        }
    }

    /// Stop immediately without releasing the lease, as a crash would.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
