//! Mock implementations for testing
//!
//! [`MockWire`] stands in for a broker connection, [`RecordingCallback`]
//! captures deliveries and [`FailingStore`] simulates a broken storage
//! backend.

use crate::routing::callback::{CallbackError, CallbackHandle, MessageCallback};
use crate::store::{
    EventFilter, EventId, EventRecord, EventStatus, EventStore, MemoryStore, StoreError,
};
use crate::transport::{InboundMessage, QoS, WireClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("mock wire: {0}")]
pub struct MockWireError(pub String);

/// One call made against a [`MockWire`], in call order
#[derive(Debug, Clone, PartialEq)]
pub enum WireCall {
    Connect(String),
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Bytes },
}

/// Scriptable in-process wire client
///
/// Calls are recorded whether or not they succeed. Subscribe and publish
/// fail while the mock is disconnected.
pub struct MockWire {
    link: watch::Sender<bool>,
    connect_failures: AtomicUsize,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    calls: Mutex<Vec<WireCall>>,
    delivered: Mutex<Vec<(String, Bytes)>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MockWire {
    pub fn new() -> Self {
        let (link, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            link,
            connect_failures: AtomicUsize::new(0),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    /// Simulate the broker dropping the connection
    pub fn drop_connection(&self) {
        self.link.send_replace(false);
    }

    /// Queue an inbound message as if the broker had delivered it
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        let _ = self
            .inbound_tx
            .send(InboundMessage::new(topic.into(), payload.into()));
    }

    pub async fn calls(&self) -> Vec<WireCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    pub async fn connect_attempts(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| matches!(call, WireCall::Connect(_)))
            .count()
    }

    pub async fn subscribe_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                WireCall::Subscribe(pattern) => Some(pattern.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn unsubscribe_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                WireCall::Unsubscribe(pattern) => Some(pattern.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every publish attempt, successful or not
    pub async fn publish_attempts(&self) -> Vec<(String, Bytes)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                WireCall::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Publishes the "broker" accepted
    pub async fn delivered(&self) -> Vec<(String, Bytes)> {
        self.delivered.lock().await.clone()
    }

    async fn record(&self, call: WireCall) {
        self.calls.lock().await.push(call);
    }

    fn ensure_connected(&self) -> Result<(), MockWireError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MockWireError("not connected".to_string()))
        }
    }
}

impl Default for MockWire {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WireClient for MockWire {
    type Error = MockWireError;

    async fn connect(&self, broker_url: &str) -> Result<(), Self::Error> {
        self.record(WireCall::Connect(broker_url.to_string())).await;

        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MockWireError("connection refused".to_string()));
        }

        self.link.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.record(WireCall::Disconnect).await;
        self.link.send_replace(false);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, _qos: QoS) -> Result<(), Self::Error> {
        self.record(WireCall::Subscribe(pattern.to_string())).await;
        self.ensure_connected()?;
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MockWireError("subscribe rejected".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        self.record(WireCall::Unsubscribe(pattern.to_string())).await;
        self.ensure_connected()
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), Self::Error> {
        self.record(WireCall::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
        })
        .await;
        self.ensure_connected()?;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MockWireError("publish rejected".to_string()));
        }
        self.delivered.lock().await.push((topic.to_string(), payload));
        Ok(())
    }

    async fn next_message(&self) -> Option<InboundMessage> {
        let mut link = self.link.subscribe();
        let mut inbound = self.inbound_rx.lock().await;

        tokio::select! {
            biased;
            _ = link.wait_for(|up| !*up) => None,
            message = inbound.recv() => message,
        }
    }
}

/// Callback that records every delivery and can be told to fail
#[derive(Default)]
pub struct RecordingCallback {
    received: Mutex<Vec<(String, Bytes)>>,
    should_fail: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let callback = Self::default();
        callback.should_fail.store(true, Ordering::SeqCst);
        Arc::new(callback)
    }

    /// Callback that sleeps before recording
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn handle(self: &Arc<Self>) -> CallbackHandle {
        CallbackHandle::from_arc(self.clone())
    }

    pub async fn received(&self) -> Vec<(String, Bytes)> {
        self.received.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.received.lock().await.len()
    }

    /// Poll until at least `count` deliveries arrived or `timeout` elapsed
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count().await >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MessageCallback for RecordingCallback {
    async fn on_message(&self, topic: &str, payload: Bytes) -> Result<(), CallbackError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.received
            .lock()
            .await
            .push((topic.to_string(), payload));
        if self.should_fail.load(Ordering::SeqCst) {
            return Err("recording callback told to fail".into());
        }
        Ok(())
    }
}

/// Store whose writes, status updates and reads can be switched off
/// independently
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_updates: AtomicBool,
    fail_reads: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail `update` only; inserts keep working
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io_failure("disk full"));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io_failure("store unreadable"));
        }
        Ok(())
    }
}

fn io_failure(message: &str) -> StoreError {
    StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
}

#[async_trait]
impl EventStore for FailingStore {
    async fn insert(&self, record: EventRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn update(&self, id: EventId, status: EventStatus) -> Result<EventStatus, StoreError> {
        self.check()?;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(io_failure("status write failed"));
        }
        self.inner.update(id, status).await
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, StoreError> {
        self.check_read()?;
        self.inner.query(filter).await
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        self.check_read()?;
        self.inner.get(id).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.check_read()?;
        self.inner.count().await
    }
}
