//! In-process partitioned broker.

use crate::{Acknowledgment, BrokerError, BrokerProducer, BrokerResult, Partitioner, ProducerRecord};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// A record as appended to a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub record: ProducerRecord,
    pub partition: u32,
    pub offset: i64,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<(String, u32), Vec<ProducerRecord>>,
    sent: Vec<SentRecord>,
    failures: VecDeque<BrokerError>,
}

/// Partitioned log held in memory, with scripted failure injection.
///
/// Each send either pops the next queued failure or appends the record to
/// `(topic, partition)` and acknowledges with its offset in that log.
pub struct InMemoryBroker {
    partitions: u32,
    partitioner: Partitioner,
    latency: Option<Duration>,
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            partitioner: Partitioner::new(),
            latency: None,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Delay every acknowledgment by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Fail the next `n` sends with clones of `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next_n(&self, n: usize, error: BrokerError) {
        let mut state = self.state();
        for _ in 0..n {
            state.failures.push_back(error.clone());
        }
    }

    /// Every acknowledged record, in acknowledgment order.
    pub fn sent(&self) -> Vec<SentRecord> {
        self.state().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }

    /// The log of one partition.
    pub fn partition_log(&self, topic: &str, partition: u32) -> Vec<ProducerRecord> {
        self.state()
            .logs
            .get(&(topic.to_string(), partition))
            .cloned()
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn send(&self, record: ProducerRecord) -> BrokerResult<Acknowledgment> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(error) = state.failures.pop_front() {
            debug!(topic = %record.topic, error = %error, "Injected broker failure");
            return Err(error);
        }

        let partition = self.partitioner.partition(record.key.as_deref(), self.partitions);
        let log = state
            .logs
            .entry((record.topic.clone(), partition))
            .or_default();
        let offset = log.len() as i64;
        log.push(record.clone());

        let topic = record.topic.clone();
        state.sent.push(SentRecord {
            record,
            partition,
            offset,
        });

        Ok(Acknowledgment {
            topic,
            partition,
            offset: Some(offset),
        })
    }
}
