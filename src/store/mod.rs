//! Durable event store
//!
//! The outbox delegates every mutation to an [`EventStore`]. Two backends ship
//! with the crate: [`MemoryStore`] for tests and ephemeral deployments, and
//! [`DocumentStore`] which persists the record set as a JSON document so
//! undelivered events survive restarts.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod document;
pub mod memory;
pub mod record;

pub use document::DocumentStore;
pub use memory::MemoryStore;
pub use record::{EventFilter, EventId, EventRecord, EventStatus};

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event not found: {0}")]
    NotFound(EventId),
    #[error("event already exists: {0}")]
    Duplicate(EventId),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize event records: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage collaborator for event records
///
/// Implementations serialize conflicting writes to the same id and return
/// query results in insertion order, oldest first.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, record: EventRecord) -> Result<(), StoreError>;

    /// Request a status transition; returns the status the record ends up with.
    /// Disallowed transitions leave the record unchanged.
    async fn update(&self, id: EventId, status: EventStatus) -> Result<EventStatus, StoreError>;

    async fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, StoreError>;

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Shared, dynamically selected store
pub type SharedStore = Arc<dyn EventStore>;
