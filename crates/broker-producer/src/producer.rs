//! The producer seam used by the relay.

use crate::BrokerResult;
use async_trait::async_trait;
use outbox_envelope::Header;
use std::sync::Arc;

/// A record ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
}

impl ProducerRecord {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }
}

/// Broker confirmation of a durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub topic: String,
    pub partition: u32,
    /// Not every transport reports offsets.
    pub offset: Option<i64>,
}

/// Sends records to a message broker.
///
/// `send` resolves only once the broker has acknowledged the write, or with
/// a classified error. Implementations must not retry internally.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> BrokerResult<Acknowledgment>;
}

#[async_trait]
impl<P: BrokerProducer + ?Sized> BrokerProducer for Arc<P> {
    async fn send(&self, record: ProducerRecord) -> BrokerResult<Acknowledgment> {
        (**self).send(record).await
    }
}
