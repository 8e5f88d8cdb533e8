//! Self-describing binary envelope for outbox messages.
//!
//! An [`Envelope`] is split into the three columns of an outbox row:
//! - `key`: the raw partitioning key
//! - `value`: magic + format version + protobuf value frame (payload and metadata)
//! - `headers`: protobuf header frame (ordered name/value pairs)
//!
//! Decoding is forward-compatible: unknown protobuf fields are ignored and
//! newer format versions are accepted, so writers and relays on different
//! releases interoperate during a rolling deployment.

mod envelope;
mod error;
mod frame;
mod headers;

pub use envelope::{decode, encode, EncodedEnvelope, Envelope, Metadata, FORMAT_VERSION, MAGIC};
pub use error::{EnvelopeError, EnvelopeResult};
pub use headers::{Header, Headers};
