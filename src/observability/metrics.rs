//! Thread-safe bus metrics
//!
//! Atomic counters owned by one bus instance and shared with its components.

use crate::supervisor::state::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct BusMetrics {
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_replayed: AtomicU64,
    messages_received: AtomicU64,
    callbacks_dispatched: AtomicU64,
    callback_failures: AtomicU64,
    subscriptions: AtomicU64,
    last_connected_at: AtomicU64,
    started_at: u64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_replayed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            callbacks_dispatched: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            last_connected_at: AtomicU64::new(0),
            started_at: current_timestamp(),
        }
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.last_connected_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.messages_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_dispatched(&self) {
        self.callbacks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_subscriptions(&self, count: usize) {
        self.subscriptions.store(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, state: ConnectionState, outbox_backlog: Option<u64>) -> MetricsSnapshot {
        let now = current_timestamp();
        let last_connected_at = self.last_connected_at.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.started_at),
            connection: ConnectionMetrics {
                state,
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                lost: self.connections_lost.load(Ordering::Relaxed),
                last_connected_at: (last_connected_at > 0).then_some(last_connected_at),
            },
            publishing: PublishMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                failures: self.publish_failures.load(Ordering::Relaxed),
                replayed: self.messages_replayed.load(Ordering::Relaxed),
                outbox_backlog,
            },
            dispatch: DispatchMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                callbacks_dispatched: self.callbacks_dispatched.load(Ordering::Relaxed),
                callback_failures: self.callback_failures.load(Ordering::Relaxed),
                subscriptions: self.subscriptions.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all metrics, serialised by the `/metrics` endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connection: ConnectionMetrics,
    pub publishing: PublishMetrics,
    pub dispatch: DispatchMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub state: ConnectionState,
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub lost: u64,
    pub last_connected_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub published: u64,
    pub failures: u64,
    pub replayed: u64,
    pub outbox_backlog: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub received: u64,
    pub callbacks_dispatched: u64,
    pub callback_failures: u64,
    pub subscriptions: u64,
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
