//! Subscriber callbacks
//!
//! A callback is anything invocable with `(topic, payload)`. Closures are
//! wrapped with [`CallbackHandle::from_fn`], richer subscribers implement
//! [`MessageCallback`] directly.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Error returned by a failing callback; logged and discarded by the dispatcher
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Capability interface for message subscribers
#[async_trait]
pub trait MessageCallback: Send + Sync {
    async fn on_message(&self, topic: &str, payload: Bytes) -> Result<(), CallbackError>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> MessageCallback for FnCallback<F>
where
    F: Fn(String, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send,
{
    async fn on_message(&self, topic: &str, payload: Bytes) -> Result<(), CallbackError> {
        (self.0)(topic.to_string(), payload).await
    }
}

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity-carrying handle to a registered callback
///
/// Two handles are equal only if one was cloned from the other, so the same
/// handle can be subscribed and later unsubscribed by value.
#[derive(Clone)]
pub struct CallbackHandle {
    id: u64,
    callback: Arc<dyn MessageCallback>,
}

impl CallbackHandle {
    pub fn new<C: MessageCallback + 'static>(callback: C) -> Self {
        Self::from_arc(Arc::new(callback))
    }

    pub fn from_arc(callback: Arc<dyn MessageCallback>) -> Self {
        Self {
            id: NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed),
            callback,
        }
    }

    /// Wrap an async closure taking `(topic, payload)`
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        Self::new(FnCallback(f))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn invoke(&self, topic: &str, payload: Bytes) -> Result<(), CallbackError> {
        self.callback.on_message(topic, payload).await
    }
}

impl PartialEq for CallbackHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CallbackHandle {}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}
