//! Structured logging, bus metrics and HTTP health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{BusMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{dispatch_span, lifecycle_span, mqtt_span, replay_span};
