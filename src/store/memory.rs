//! In-memory event store

use super::record::{EventFilter, EventId, EventRecord, EventStatus};
use super::{EventStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Insertion-ordered record set with an id index, shared by both backends
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordSet {
    records: Vec<EventRecord>,
    index: HashMap<EventId, usize>,
}

impl RecordSet {
    pub(crate) fn from_records(records: Vec<EventRecord>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(position, record)| (record.id, position))
            .collect();
        Self { records, index }
    }

    pub(crate) fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub(crate) fn insert(&mut self, record: EventRecord) -> Result<(), StoreError> {
        if self.index.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        self.index.insert(record.id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    /// Returns the resulting status and whether anything changed
    pub(crate) fn update(
        &mut self,
        id: EventId,
        status: EventStatus,
    ) -> Result<(EventStatus, bool), StoreError> {
        let position = *self.index.get(&id).ok_or(StoreError::NotFound(id))?;
        let record = &mut self.records[position];
        let changed = record.apply_status(status, Utc::now());
        if !changed {
            debug!(
                event_id = %id,
                current = %record.status,
                requested = %status,
                "Ignoring disallowed status transition"
            );
        }
        Ok((record.status, changed))
    }

    pub(crate) fn query(&self, filter: &EventFilter) -> Vec<EventRecord> {
        self.records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    pub(crate) fn get(&self, id: EventId) -> Option<EventRecord> {
        self.index
            .get(&id)
            .map(|&position| self.records[position].clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Volatile store; records are lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<RecordSet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert(&self, record: EventRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record)
    }

    async fn update(&self, id: EventId, status: EventStatus) -> Result<EventStatus, StoreError> {
        let (status, _) = self.records.write().await.update(id, status)?;
        Ok(status)
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.records.read().await.query(filter))
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.records.read().await.get(id))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }
}
