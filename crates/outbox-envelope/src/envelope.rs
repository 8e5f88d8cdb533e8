//! Envelope encoding and decoding.

use crate::frame::{HeaderFrame, ValueFrame};
use crate::{EnvelopeError, EnvelopeResult, Header, Headers};
use prost::Message;
use std::collections::BTreeMap;
use tracing::debug;

/// Leading bytes of every value frame.
pub const MAGIC: [u8; 2] = *b"OX";

/// Format version written by this release.
pub const FORMAT_VERSION: u8 = 1;

const PREFIX_LEN: usize = MAGIC.len() + 1;

/// Correlation and trace metadata carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub correlation_id: Option<String>,
    /// W3C `traceparent` of the business transaction that produced the message.
    pub trace_parent: Option<String>,
    pub content_type: Option<String>,
    pub produced_at_ms: Option<i64>,
    /// Free-form metadata. Keys unknown to the relay travel untouched.
    pub extensions: BTreeMap<String, String>,
}

impl Metadata {
    /// Render metadata as broker headers.
    pub fn to_headers(&self) -> Vec<Header> {
        let mut headers = Vec::new();
        if let Some(id) = &self.correlation_id {
            headers.push(Header::new("x-correlation-id", id.as_bytes()));
        }
        if let Some(tp) = &self.trace_parent {
            headers.push(Header::new("traceparent", tp.as_bytes()));
        }
        if let Some(ct) = &self.content_type {
            headers.push(Header::new("content-type", ct.as_bytes()));
        }
        headers
    }
}

/// A message as written by business code and sent by the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub metadata: Metadata,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(key: Option<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
            headers: Headers::new(),
            metadata: Metadata {
                produced_at_ms: Some(chrono::Utc::now().timestamp_millis()),
                ..Default::default()
            },
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    pub fn with_trace_parent(mut self, trace_parent: impl Into<String>) -> Self {
        self.metadata.trace_parent = Some(trace_parent.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = Some(content_type.into());
        self
    }
}

/// Column values for an outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEnvelope {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<u8>,
}

/// Encode an envelope into outbox column values.
pub fn encode(envelope: &Envelope) -> EncodedEnvelope {
    let frame = ValueFrame {
        payload: envelope.payload.clone(),
        correlation_id: envelope.metadata.correlation_id.clone(),
        trace_parent: envelope.metadata.trace_parent.clone(),
        content_type: envelope.metadata.content_type.clone(),
        produced_at_ms: envelope.metadata.produced_at_ms,
        extensions: envelope.metadata.extensions.clone(),
    };

    let mut value = Vec::with_capacity(PREFIX_LEN + frame.encoded_len());
    value.extend_from_slice(&MAGIC);
    value.push(FORMAT_VERSION);
    value.extend(frame.encode_to_vec());

    let headers = if envelope.headers.is_empty() {
        Vec::new()
    } else {
        HeaderFrame {
            headers: envelope.headers.clone().into_vec(),
        }
        .encode_to_vec()
    };

    EncodedEnvelope {
        key: envelope.key.clone(),
        value,
        headers,
    }
}

/// Decode outbox column values back into an envelope.
pub fn decode(key: Option<&[u8]>, value: &[u8], headers: &[u8]) -> EnvelopeResult<Envelope> {
    if value.len() < PREFIX_LEN {
        return Err(EnvelopeError::Truncated(value.len()));
    }
    let magic = [value[0], value[1]];
    if magic != MAGIC {
        return Err(EnvelopeError::BadMagic(magic));
    }
    let version = value[2];
    if version == 0 {
        return Err(EnvelopeError::UnsupportedVersion(version));
    }
    if version > FORMAT_VERSION {
        debug!(version, current = FORMAT_VERSION, "Decoding envelope from a newer writer");
    }

    let frame = ValueFrame::decode(&value[PREFIX_LEN..])?;
    let header_frame = if headers.is_empty() {
        HeaderFrame::default()
    } else {
        HeaderFrame::decode(headers)?
    };

    Ok(Envelope {
        key: key.map(<[u8]>::to_vec),
        payload: frame.payload,
        headers: Headers::from(header_frame.headers),
        metadata: Metadata {
            correlation_id: frame.correlation_id,
            trace_parent: frame.trace_parent,
            content_type: frame.content_type,
            produced_at_ms: frame.produced_at_ms,
            extensions: frame.extensions,
        },
    })
}
