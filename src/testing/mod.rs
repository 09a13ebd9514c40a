//! Test doubles
//!
//! [`MockWire`] stands in for a broker connection, [`RecordingCallback`]
//! captures deliveries and [`FailingStore`] injects storage faults.

pub mod mocks;

pub use mocks::*;
