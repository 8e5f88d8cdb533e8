//! Outbox error types.

use broker_producer::BrokerError;
use outbox_database::DatabaseError;
use outbox_envelope::EnvelopeError;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The outbox or lock table could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    /// This instance no longer holds the relay lease.
    #[error("Lease lost on lock {lock_name}")]
    LeaseLost { lock_name: String },

    /// The broker did not acknowledge a record.
    #[error("Broker send failed for record {record_id}: {source}")]
    BrokerSend {
        record_id: i64,
        #[source]
        source: BrokerError,
    },

    /// A stored record is not a valid envelope.
    #[error("Failed to decode record {record_id}: {source}")]
    Decode {
        record_id: i64,
        #[source]
        source: EnvelopeError,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OutboxError {
    /// Whether the failure is tied to a record that will never publish as is.
    pub fn is_poison(&self) -> bool {
        match self {
            OutboxError::Decode { .. } => true,
            OutboxError::BrokerSend { source, .. } => !source.is_transient(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for OutboxError {
    fn from(e: rusqlite::Error) -> Self {
        OutboxError::Persistence(DatabaseError::Sqlite(e))
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_classification() {
        let transient = OutboxError::BrokerSend {
            record_id: 1,
            source: BrokerError::Transient("timeout".to_string()),
        };
        let permanent = OutboxError::BrokerSend {
            record_id: 1,
            source: BrokerError::Permanent("too large".to_string()),
        };
        let decode = OutboxError::Decode {
            record_id: 1,
            source: EnvelopeError::Truncated(0),
        };

        assert!(!transient.is_poison());
        assert!(permanent.is_poison());
        assert!(decode.is_poison());
        assert!(!OutboxError::LeaseLost {
            lock_name: "relay".to_string()
        }
        .is_poison());
    }

    #[test]
    fn test_error_messages_name_the_record() {
        let err = OutboxError::BrokerSend {
            record_id: 42,
            source: BrokerError::Permanent("rejected".to_string()),
        };
        assert!(err.to_string().contains("record 42"));
    }
}
