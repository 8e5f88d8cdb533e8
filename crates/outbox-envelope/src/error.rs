//! Envelope error types.

use thiserror::Error;

/// Envelope decode error.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Value frame shorter than its fixed prefix
    #[error("Truncated value frame ({0} bytes)")]
    Truncated(usize),

    /// Value frame does not start with the envelope magic
    #[error("Bad envelope magic: {0:02x?}")]
    BadMagic([u8; 2]),

    /// Format version that can never be valid
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// Protobuf decoding error
    #[error("Protobuf error: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Result type alias using EnvelopeError.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
