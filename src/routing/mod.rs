//! Topic routing
//!
//! Subscribing and inbound delivery:
//!
//! - [`matcher`]: topic pattern validation and matching (pure functions)
//! - [`callback`]: the callback capability and its identity-carrying handle
//! - [`registry`]: pattern to callback mapping with reference-counted wire
//!   subscriptions
//! - [`dispatcher`]: the inbound listener that fans messages out to callbacks

pub mod callback;
pub mod dispatcher;
pub mod matcher;
pub mod registry;

pub use callback::{CallbackError, CallbackHandle, MessageCallback};
pub use dispatcher::{Dispatcher, ListenOutcome};
pub use matcher::{classify, matches, validate_publish_topic, PatternKind, TopicError, TopicPattern};
pub use registry::{Subscription, SubscriptionRegistry};
