//! Subscription registry
//!
//! Maps exact topics and wildcard patterns to callback sets and keeps the
//! broker-side subscriptions reference counted: the first callback for a
//! pattern issues the wire subscribe, removing the last one issues the wire
//! unsubscribe. One registry exists per bus instance.

use super::callback::CallbackHandle;
use super::matcher::{PatternKind, TopicPattern};
use crate::error::{BusError, BusResult};
use crate::observability::metrics::BusMetrics;
use crate::transport::{QoS, WireClient};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One pattern and the callbacks registered under it
#[derive(Debug, Clone)]
pub struct Subscription {
    pub pattern: TopicPattern,
    pub callbacks: Vec<CallbackHandle>,
}

#[derive(Debug, Default)]
struct Entries {
    exact: HashMap<String, Subscription>,
    // BTreeMap keeps wildcard iteration order stable
    wildcard: BTreeMap<String, Subscription>,
}

impl Entries {
    fn get_mut(&mut self, pattern: &str) -> Option<&mut Subscription> {
        match self.exact.get_mut(pattern) {
            Some(subscription) => Some(subscription),
            None => self.wildcard.get_mut(pattern),
        }
    }

    fn remove(&mut self, pattern: &str) -> Option<Subscription> {
        self.exact
            .remove(pattern)
            .or_else(|| self.wildcard.remove(pattern))
    }

    fn insert(&mut self, subscription: Subscription) {
        let key = subscription.pattern.as_str().to_string();
        match subscription.pattern.kind() {
            PatternKind::Exact => self.exact.insert(key, subscription),
            PatternKind::Wildcard => self.wildcard.insert(key, subscription),
        };
    }

    fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }
}

/// Registry of subscriptions, shared by the bus, dispatcher and supervisor
pub struct SubscriptionRegistry<W: WireClient> {
    wire: Arc<W>,
    qos: QoS,
    entries: RwLock<Entries>,
    pattern_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
    metrics: Arc<BusMetrics>,
}

impl<W: WireClient> SubscriptionRegistry<W> {
    pub fn new(wire: Arc<W>, qos: QoS, metrics: Arc<BusMetrics>) -> Self {
        Self {
            wire,
            qos,
            entries: RwLock::new(Entries::default()),
            pattern_locks: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Register `callback` under `pattern`
    ///
    /// The first callback for a pattern issues exactly one wire subscribe
    /// before returning. If that fails (typically while disconnected) the
    /// registration is kept and the next `resubscribe_all` picks it up.
    pub async fn subscribe(&self, pattern: &str, callback: CallbackHandle) -> BusResult<()> {
        let compiled = TopicPattern::compile(pattern).map_err(BusError::InvalidPattern)?;

        let lock = self.pattern_lock(pattern).await;
        let guard = lock.lock().await;

        let is_new = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(pattern) {
                Some(subscription) => {
                    if !subscription.callbacks.contains(&callback) {
                        subscription.callbacks.push(callback);
                    }
                    false
                }
                None => {
                    entries.insert(Subscription {
                        pattern: compiled,
                        callbacks: vec![callback],
                    });
                    self.metrics.set_subscriptions(entries.len());
                    true
                }
            }
        };

        if is_new {
            match self.wire.subscribe(pattern, self.qos).await {
                Ok(()) => info!(pattern = %pattern, "Subscribed"),
                Err(e) => warn!(
                    pattern = %pattern,
                    error = %e,
                    "Wire subscribe failed, will retry on next connect"
                ),
            }
        }

        drop(guard);
        Ok(())
    }

    /// Remove one callback, or every callback when `callback` is `None`
    ///
    /// Unknown patterns or callbacks are a no-op. The wire unsubscribe is
    /// issued once, when the callback set becomes empty.
    pub async fn unsubscribe(&self, pattern: &str, callback: Option<&CallbackHandle>) {
        let lock = self.pattern_lock(pattern).await;
        let guard = lock.lock().await;

        let emptied = {
            let mut entries = self.entries.write().await;
            let now_empty = match entries.get_mut(pattern) {
                Some(subscription) => {
                    match callback {
                        Some(callback) => subscription.callbacks.retain(|c| c != callback),
                        None => subscription.callbacks.clear(),
                    }
                    subscription.callbacks.is_empty()
                }
                None => false,
            };
            if now_empty {
                entries.remove(pattern);
                self.metrics.set_subscriptions(entries.len());
            }
            now_empty
        };

        if emptied {
            match self.wire.unsubscribe(pattern).await {
                Ok(()) => info!(pattern = %pattern, "Unsubscribed"),
                Err(e) => warn!(pattern = %pattern, error = %e, "Wire unsubscribe failed"),
            }
        } else {
            debug!(pattern = %pattern, "Unsubscribe left pattern registered or was unknown");
        }

        drop(guard);
    }

    /// Callbacks for a delivered topic: the exact entry plus every matching
    /// wildcard entry, each callback at most once
    pub async fn matching_callbacks(&self, topic: &str) -> Vec<CallbackHandle> {
        let entries = self.entries.read().await;
        let mut matched: Vec<CallbackHandle> = Vec::new();

        let exact = entries.exact.get(topic).into_iter();
        let wildcard = entries
            .wildcard
            .values()
            .filter(|subscription| subscription.pattern.matches(topic));

        for subscription in exact.chain(wildcard) {
            for callback in &subscription.callbacks {
                if !matched.contains(callback) {
                    matched.push(callback.clone());
                }
            }
        }

        matched
    }

    /// Re-issue the wire subscribe for every registered pattern
    ///
    /// Does not touch the registry. Returns how many subscribes succeeded.
    pub async fn resubscribe_all(&self) -> usize {
        let patterns = self.patterns().await;
        let mut succeeded = 0;

        for pattern in &patterns {
            match self.wire.subscribe(pattern, self.qos).await {
                Ok(()) => {
                    succeeded += 1;
                    debug!(pattern = %pattern, "Re-subscribed");
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "Failed to re-subscribe"),
            }
        }

        info!(
            "Re-subscribed {}/{} patterns after connect",
            succeeded,
            patterns.len()
        );
        succeeded
    }

    /// Every registered pattern, exact ones first
    pub async fn patterns(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut exact: Vec<String> = entries.exact.keys().cloned().collect();
        exact.sort();
        exact.extend(entries.wildcard.keys().cloned());
        exact
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Lock serialising wire subscribe/unsubscribe for one pattern
    ///
    /// The map only holds weak references; an entry dies with the last
    /// caller holding its lock and is pruned on the next lookup.
    async fn pattern_lock(&self, pattern: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pattern_locks.lock().await;
        locks.retain(|_, lock| lock.strong_count() > 0);

        if let Some(lock) = locks.get(pattern).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(pattern.to_string(), Arc::downgrade(&lock));
        lock
    }
}
