//! Broker error types.

use thiserror::Error;

/// Broker send failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Timeouts, connection failures, throttling or broker unavailability.
    /// Retrying the same record may succeed.
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// The broker rejected the record itself. Retrying will not help.
    #[error("Permanent broker error: {0}")]
    Permanent(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            BrokerError::Permanent(e.to_string())
        } else {
            // Timeouts, connect errors and unreadable responses all leave the
            // outcome unknown, so the record is sent again.
            BrokerError::Transient(e.to_string())
        }
    }
}

/// Result type alias using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;
