//! Protobuf wire frames.
//!
//! Tags are append-only. Never reuse or renumber a tag: older relays skip
//! tags they do not know, which is what keeps the format forward-compatible.

use crate::Header;
use std::collections::BTreeMap;

/// Payload and metadata, stored in the `value` column after the fixed prefix.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ValueFrame {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(string, optional, tag = "2")]
    pub correlation_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub trace_parent: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub content_type: Option<String>,
    #[prost(int64, optional, tag = "5")]
    pub produced_at_ms: Option<i64>,
    #[prost(btree_map = "string, string", tag = "6")]
    pub extensions: BTreeMap<String, String>,
}

/// Ordered headers, stored in the `headers` column.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct HeaderFrame {
    #[prost(message, repeated, tag = "1")]
    pub headers: Vec<Header>,
}
