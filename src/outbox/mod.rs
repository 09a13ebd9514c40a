//! Durable outbox
//!
//! Every publish is recorded here before it touches the wire, so an event is
//! never lost between "producer called publish" and "broker acknowledged".
//! Unconfirmed records are replayed by the supervisor after each connect.

use crate::error::BusResult;
use crate::store::{EventFilter, EventId, EventRecord, EventStatus, SharedStore};
use chrono::{DateTime, Utc};
use tracing::debug;

pub mod pipeline;

pub use pipeline::PublishPipeline;

#[derive(Clone)]
pub struct DurableOutbox {
    store: SharedStore,
}

impl DurableOutbox {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Persist a new pending record and return its id
    pub async fn record(&self, topic: &str, payload: &[u8]) -> BusResult<EventId> {
        let record = EventRecord::pending(topic, payload);
        let id = record.id;
        self.store.insert(record).await?;
        debug!(event_id = %id, topic = %topic, bytes = payload.len(), "Recorded outbound event");
        Ok(id)
    }

    /// Mark delivered; a no-op if the record is already sent
    pub async fn mark_sent(&self, id: EventId) -> BusResult<EventStatus> {
        Ok(self.store.update(id, EventStatus::Sent).await?)
    }

    /// Mark the last attempt as failed; never downgrades a sent record
    pub async fn mark_failed(&self, id: EventId) -> BusResult<EventStatus> {
        Ok(self.store.update(id, EventStatus::Failed).await?)
    }

    /// Records created at or after `since` whose status is in `statuses`,
    /// oldest first. `None` means no restriction on that axis.
    pub async fn replay_candidates(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: Option<Vec<EventStatus>>,
    ) -> BusResult<Vec<EventRecord>> {
        let filter = EventFilter { since, statuses };
        Ok(self.store.query(&filter).await?)
    }

    /// Every record still awaiting delivery, oldest first
    pub async fn unconfirmed(&self) -> BusResult<Vec<EventRecord>> {
        self.replay_candidates(None, Some(EventStatus::unconfirmed()))
            .await
    }

    pub async fn get(&self, id: EventId) -> BusResult<Option<EventRecord>> {
        Ok(self.store.get(id).await?)
    }

    /// Number of records still awaiting delivery
    pub async fn backlog(&self) -> BusResult<usize> {
        Ok(self.unconfirmed().await?.len())
    }

    pub async fn len(&self) -> BusResult<usize> {
        Ok(self.store.count().await?)
    }

    pub async fn is_empty(&self) -> BusResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}
