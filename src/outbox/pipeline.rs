//! Publish pipeline
//!
//! Record first, then try the wire if the connection is up, then mark the
//! outcome. A send failure is never reported to the producer: the record
//! stays unconfirmed and is replayed on the next connect.

use super::DurableOutbox;
use crate::error::{BusError, BusResult};
use crate::observability::metrics::BusMetrics;
use crate::routing::matcher::validate_publish_topic;
use crate::store::{EventId, EventRecord, EventStatus};
use crate::supervisor::state::{can_publish, ConnectionState};
use crate::transport::{QoS, WireClient};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Tally of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    /// Left untouched because the connection went away mid-pass
    pub skipped: usize,
}

pub struct PublishPipeline<W: WireClient> {
    wire: Arc<W>,
    outbox: DurableOutbox,
    state: watch::Receiver<ConnectionState>,
    qos: QoS,
    metrics: Arc<BusMetrics>,
}

impl<W: WireClient> PublishPipeline<W> {
    pub fn new(
        wire: Arc<W>,
        outbox: DurableOutbox,
        state: watch::Receiver<ConnectionState>,
        qos: QoS,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        Self {
            wire,
            outbox,
            state,
            qos,
            metrics,
        }
    }

    /// Record and, if connected, send one message
    ///
    /// Returns the id of the new record. Fails only if the topic is not a
    /// valid publish topic or the store rejects the record; nothing is sent
    /// in either case.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> BusResult<EventId> {
        validate_publish_topic(topic).map_err(BusError::InvalidTopic)?;
        let payload: Bytes = payload.into();

        let id = self.outbox.record(topic, &payload).await?;
        // Once recorded the event belongs to replay; a failed status write
        // only means it may be sent again
        if let Err(e) = self.deliver(id, topic, payload).await {
            warn!(event_id = %id, error = %e, "Could not record delivery outcome");
        }
        Ok(id)
    }

    /// Send an existing record again under its original id
    pub async fn republish(&self, record: &EventRecord) -> BusResult<EventStatus> {
        self.deliver(
            record.id,
            &record.topic,
            Bytes::copy_from_slice(&record.payload),
        )
        .await
    }

    /// Look up `id` and send it again
    pub async fn republish_id(&self, id: EventId) -> BusResult<EventStatus> {
        let record = self
            .outbox
            .get(id)
            .await?
            .ok_or(BusError::UnknownEvent { id })?;
        self.republish(&record).await
    }

    /// Re-send matching records in creation order
    ///
    /// Stops touching records as soon as the connection is no longer up;
    /// those are counted as skipped and stay unconfirmed. A store error on
    /// one record is logged and counted as failed; the pass continues.
    pub async fn replay(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: Option<Vec<EventStatus>>,
    ) -> BusResult<ReplaySummary> {
        let candidates = self.outbox.replay_candidates(since, statuses).await?;
        let mut summary = ReplaySummary {
            candidates: candidates.len(),
            ..ReplaySummary::default()
        };

        if candidates.is_empty() {
            debug!("Outbox empty, nothing to replay");
            return Ok(summary);
        }

        let span = crate::replay_span!(candidates = candidates.len());
        async {
            for record in &candidates {
                if !self.is_connected() {
                    summary.skipped += 1;
                    continue;
                }
                match self.republish(record).await {
                    Ok(EventStatus::Sent) => {
                        self.metrics.record_replayed();
                        summary.sent += 1;
                    }
                    Ok(_) => summary.failed += 1,
                    Err(e) => {
                        warn!(event_id = %record.id, error = %e, "Replay could not update event");
                        summary.failed += 1;
                    }
                }
            }

            info!(
                sent = summary.sent,
                failed = summary.failed,
                skipped = summary.skipped,
                "Outbox replay finished"
            );
            Ok::<ReplaySummary, BusError>(summary)
        }
        .instrument(span)
        .await
    }

    pub fn outbox(&self) -> &DurableOutbox {
        &self.outbox
    }

    pub fn is_connected(&self) -> bool {
        can_publish(*self.state.borrow())
    }

    async fn deliver(&self, id: EventId, topic: &str, payload: Bytes) -> BusResult<EventStatus> {
        if !self.is_connected() {
            debug!(event_id = %id, topic = %topic, "Not connected, leaving event for replay");
            self.metrics.record_publish_failure();
            return self.outbox.mark_failed(id).await;
        }

        match self.wire.publish(topic, payload, self.qos).await {
            Ok(()) => {
                self.metrics.record_published();
                debug!(event_id = %id, topic = %topic, "Published");
                self.outbox.mark_sent(id).await
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                warn!(event_id = %id, topic = %topic, error = %e, "Publish failed, will replay");
                self.outbox.mark_failed(id).await
            }
        }
    }
}
