//! Mapping from the config file to relay and producer settings.

use broker_producer::{RestProxyAuth, RestProxyConfig};
use outbox_config_and_utils::{BrokerSettings, Config, PoisonPolicySetting, RelaySettings};
use outbox_relay::{PoisonPolicy, RelayConfig};
use std::time::Duration;

/// Owner id for this process: the configured one, or `<hostname>-<uuid>`.
pub fn owner_id(settings: &RelaySettings) -> String {
    if let Some(owner) = &settings.owner_id {
        return owner.clone();
    }

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "relay".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

pub fn relay_config(config: &Config) -> RelayConfig {
    let relay = &config.relay;
    RelayConfig {
        lock_name: relay.lock_name.clone(),
        owner_id: owner_id(relay),
        lease_duration: Duration::from_millis(relay.lease_duration_ms),
        batch_size: relay.batch_size,
        poll_interval: Duration::from_millis(relay.poll_interval_ms),
        backoff_base: Duration::from_millis(relay.backoff_base_ms),
        backoff_max: Duration::from_millis(relay.backoff_max_ms),
        persistence_failure_threshold: relay.persistence_failure_threshold,
        event_source: relay.event_source.clone(),
        poison_policy: match &relay.poison_policy {
            PoisonPolicySetting::Block => PoisonPolicy::Block,
            PoisonPolicySetting::DeadLetter { topic } => PoisonPolicy::DeadLetter {
                topic: topic.clone(),
            },
        },
    }
}

pub fn rest_proxy_config(broker: &BrokerSettings) -> RestProxyConfig {
    RestProxyConfig {
        base_url: broker.rest_proxy_url.clone(),
        cluster_id: broker.cluster_id.clone(),
        default_partitions: broker.default_partitions,
        topic_partitions: broker.topic_partitions.clone(),
        auth: auth(broker),
        timeout_secs: broker.request_timeout_secs,
    }
}

// A bearer token wins over basic credentials.
fn auth(broker: &BrokerSettings) -> Option<RestProxyAuth> {
    if let Some(token) = &broker.auth_token {
        return Some(RestProxyAuth::Bearer(token.clone()));
    }
    match (&broker.basic_auth_user, &broker.basic_auth_password) {
        (Some(user), password) => Some(RestProxyAuth::Basic {
            user: user.clone(),
            password: password.clone().unwrap_or_default(),
        }),
        (None, _) => None,
    }
}

/// Parse a `name=value` header argument.
pub fn parse_header(arg: &str) -> Result<(String, Vec<u8>), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.as_bytes().to_vec()))
        }
        _ => Err(format!("invalid header '{}', expected NAME=VALUE", arg)),
    }
}
