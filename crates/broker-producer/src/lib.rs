//! Broker producer adapters for the outbox relay.
//!
//! This crate provides:
//! - `BrokerProducer`: the async send seam the relay publishes through
//! - `Partitioner`: Kafka-compatible key partitioning (murmur2)
//! - `RestProxyProducer`: HTTP adapter for the Kafka REST Proxy v3 API
//! - `InMemoryBroker`: partitioned in-process log for tests and local runs
//!
//! Adapters never retry. Every failure is classified as transient or
//! permanent and returned to the caller, which owns the retry policy.

mod error;
mod memory;
mod partitioner;
mod producer;
mod rest_proxy;

pub use error::{BrokerError, BrokerResult};
pub use memory::{InMemoryBroker, SentRecord};
pub use outbox_envelope::Header;
pub use partitioner::{murmur2, Partitioner};
pub use producer::{Acknowledgment, BrokerProducer, ProducerRecord};
pub use rest_proxy::{RestProxyAuth, RestProxyConfig, RestProxyProducer};
