//! Kafka REST Proxy (v3) producer.

use crate::{Acknowledgment, BrokerError, BrokerProducer, BrokerResult, Partitioner, ProducerRecord};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Credentials for the REST proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestProxyAuth {
    Bearer(String),
    Basic { user: String, password: String },
}

/// REST proxy producer configuration.
#[derive(Debug, Clone)]
pub struct RestProxyConfig {
    /// Base URL of the REST proxy, e.g. `http://localhost:8082`.
    pub base_url: String,
    /// Kafka cluster id as reported by `GET /v3/clusters`.
    pub cluster_id: String,
    /// Partition count assumed for topics without an explicit entry.
    pub default_partitions: u32,
    /// Per-topic partition counts.
    pub topic_partitions: HashMap<String, u32>,
    pub auth: Option<RestProxyAuth>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RestProxyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082".to_string(),
            cluster_id: String::new(),
            default_partitions: 1,
            topic_partitions: HashMap::new(),
            auth: None,
            timeout_secs: 30,
        }
    }
}

impl RestProxyConfig {
    pub fn partitions_for(&self, topic: &str) -> u32 {
        self.topic_partitions
            .get(topic)
            .copied()
            .unwrap_or(self.default_partitions)
    }
}

/// Request body for `POST /v3/clusters/{cluster}/topics/{topic}/records`.
#[derive(Debug, Serialize)]
struct ProduceRequest {
    partition_id: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    headers: Vec<HeaderPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<DataPayload>,
    value: DataPayload,
}

#[derive(Debug, Serialize)]
struct HeaderPayload {
    name: String,
    /// Base64 encoded.
    value: String,
}

#[derive(Debug, Serialize)]
struct DataPayload {
    #[serde(rename = "type")]
    kind: &'static str,
    /// Base64 encoded.
    data: String,
}

impl DataPayload {
    fn binary(bytes: &[u8]) -> Self {
        Self {
            kind: "BINARY",
            data: BASE64.encode(bytes),
        }
    }
}

/// Response body. Errors come back with `error_code` and `message` only.
#[derive(Debug, Deserialize)]
struct ProduceResponse {
    error_code: i32,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    partition_id: Option<u32>,
    #[serde(default)]
    offset: Option<i64>,
}

/// Producer that writes through the Kafka REST Proxy.
pub struct RestProxyProducer {
    config: RestProxyConfig,
    client: Client,
    partitioner: Partitioner,
    base_url: String,
}

impl RestProxyProducer {
    /// Create a new REST proxy producer.
    pub fn new(config: RestProxyConfig) -> BrokerResult<Self> {
        let parsed = Url::parse(&config.base_url).map_err(|e| {
            BrokerError::Permanent(format!("invalid REST proxy URL {}: {}", config.base_url, e))
        })?;
        if config.cluster_id.is_empty() {
            return Err(BrokerError::Permanent("REST proxy cluster id is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            config,
            client,
            partitioner: Partitioner::new(),
        })
    }

    fn records_url(&self, topic: &str) -> String {
        format!(
            "{}/v3/clusters/{}/topics/{}/records",
            self.base_url, self.config.cluster_id, topic
        )
    }

    fn build_request(&self, record: &ProducerRecord, partition: u32) -> ProduceRequest {
        ProduceRequest {
            partition_id: partition,
            headers: record
                .headers
                .iter()
                .map(|h| HeaderPayload {
                    name: h.name.clone(),
                    value: BASE64.encode(&h.value),
                })
                .collect(),
            key: record.key.as_deref().map(DataPayload::binary),
            value: DataPayload::binary(&record.value),
        }
    }
}

#[async_trait]
impl BrokerProducer for RestProxyProducer {
    async fn send(&self, record: ProducerRecord) -> BrokerResult<Acknowledgment> {
        let partitions = self.config.partitions_for(&record.topic);
        let partition = self.partitioner.partition(record.key.as_deref(), partitions);
        let url = self.records_url(&record.topic);
        let request = self.build_request(&record, partition);

        debug!(
            url = %url,
            topic = %record.topic,
            partition,
            bytes = record.value.len(),
            "Sending record"
        );

        let mut builder = self.client.post(&url).json(&request);
        builder = match &self.config.auth {
            Some(RestProxyAuth::Bearer(token)) => builder.bearer_auth(token),
            Some(RestProxyAuth::Basic { user, password }) => builder.basic_auth(user, Some(password)),
            None => builder,
        };

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(topic = %record.topic, status = %status, "REST proxy rejected record");
            return Err(classify_status(status, &body));
        }

        let result: ProduceResponse = response.json().await?;
        if result.error_code != 200 {
            return Err(classify_error_code(result.error_code, result.message));
        }

        Ok(Acknowledgment {
            topic: record.topic,
            partition: result.partition_id.unwrap_or(partition),
            offset: result.offset,
        })
    }
}

/// Map a non-success HTTP status to a broker error.
fn classify_status(status: StatusCode, body: &str) -> BrokerError {
    let message = format!("HTTP {}: {}", status, body);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        BrokerError::Transient(message)
    } else {
        BrokerError::Permanent(message)
    }
}

/// Map an in-body REST proxy error code (HTTP status times 100 plus detail).
fn classify_error_code(code: i32, message: Option<String>) -> BrokerError {
    let message = format!(
        "error_code {}: {}",
        code,
        message.unwrap_or_else(|| "Unknown error".to_string())
    );
    match code / 100 {
        408 | 429 | 500..=599 => BrokerError::Transient(message),
        _ => BrokerError::Permanent(message),
    }
}
