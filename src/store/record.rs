//! Persisted event records and their status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque unique identifier of one logical publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Delivery status of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Sent,
    Failed,
}

impl EventStatus {
    /// Allowed transitions: Pending -> Sent | Failed, Failed -> Sent | Failed.
    /// Nothing returns to Pending and Sent is final.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::Pending, EventStatus::Sent)
                | (EventStatus::Pending, EventStatus::Failed)
                | (EventStatus::Failed, EventStatus::Sent)
                | (EventStatus::Failed, EventStatus::Failed)
        )
    }

    /// Statuses that still need delivery
    pub fn unconfirmed() -> Vec<EventStatus> {
        vec![EventStatus::Pending, EventStatus::Failed]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Sent => "sent",
            EventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EventStatus::Pending),
            "sent" => Ok(EventStatus::Sent),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A durable record of one publish attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of recorded send outcomes (sent or failed)
    #[serde(default)]
    pub attempts: u32,
}

impl EventRecord {
    /// New pending record with a freshly allocated id
    pub fn pending(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            topic: topic.into(),
            payload: payload.into(),
            status: EventStatus::Pending,
            created_at: now,
            updated_at: now,
            attempts: 0,
        }
    }

    /// Apply a status transition in place; returns false if it was not allowed
    pub fn apply_status(&mut self, status: EventStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.updated_at = at;
        self.attempts = self.attempts.saturating_add(1);
        true
    }
}

/// Query filter: records created at or after `since` whose status is in `statuses`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub statuses: Option<Vec<EventStatus>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn unconfirmed() -> Self {
        Self {
            since: None,
            statuses: Some(EventStatus::unconfirmed()),
        }
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<EventStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        let after_since = self.since.map_or(true, |since| record.created_at >= since);
        let status_ok = self
            .statuses
            .as_ref()
            .map_or(true, |statuses| statuses.contains(&record.status));
        after_since && status_ok
    }
}
