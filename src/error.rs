//! Error taxonomy for the message bus
//!
//! Network-layer failures never reach producers: they are recovered by the
//! supervisor (reconnect) or the outbox (replay) and only show up in logs.
//! The variants here are the ones that do surface synchronously.

use crate::routing::matcher::TopicError;
use crate::store::{EventId, StoreError};
use thiserror::Error;

/// Main error type for bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid subscription pattern: {0}")]
    InvalidPattern(#[source] TopicError),

    #[error("Invalid publish topic: {0}")]
    InvalidTopic(#[source] TopicError),

    #[error("Unknown event: {id}")]
    UnknownEvent { id: EventId },

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Bus is already running")]
    AlreadyRunning,
}

impl From<StoreError> for BusError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => BusError::UnknownEvent { id },
            other => BusError::Store(other),
        }
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_becomes_unknown_event() {
        let id = EventId::new();
        let error: BusError = StoreError::NotFound(id).into();

        assert!(matches!(error, BusError::UnknownEvent { id: unknown } if unknown == id));
        assert!(error.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_other_store_errors_stay_store_errors() {
        let error: BusError = StoreError::Io(std::io::Error::other("disk full")).into();
        assert!(matches!(error, BusError::Store(StoreError::Io(_))));
    }

    #[test]
    fn test_invalid_pattern_display() {
        let error = BusError::InvalidPattern(TopicError::MisplacedMultiLevel("a/#/b".to_string()));
        assert_eq!(
            error.to_string(),
            "Invalid subscription pattern: '#' must be the last segment: a/#/b"
        );
    }

    #[test]
    fn test_surfaced_variants_display() {
        let id = EventId::new();

        assert_eq!(
            BusError::UnknownEvent { id }.to_string(),
            format!("Unknown event: {id}")
        );
        assert_eq!(BusError::AlreadyRunning.to_string(), "Bus is already running");
    }
}
