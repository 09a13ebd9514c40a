//! Pure connection state machine and reconnect policy
//!
//! Transitions are computed by [`next_state`]; [`ConnectionStateMachine`] is
//! the only place they are applied, and only the supervisor holds one.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection state owned by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectAttempted,
    ConnectSucceeded,
    ConnectFailed(String),
    ConnectionLost(String),
    StopRequested,
    DisconnectCompleted,
}

/// Compute the next state, or `None` if the event is not valid in `current`
pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (current, event) {
        (S::Disconnected, E::ConnectAttempted) => Some(S::Connecting),
        (S::Connecting, E::ConnectSucceeded) => Some(S::Connected),
        (S::Connecting, E::ConnectFailed(_)) => Some(S::Disconnected),
        (S::Connected, E::ConnectionLost(_)) => Some(S::Disconnected),
        (S::Connected | S::Connecting, E::StopRequested) => Some(S::Disconnecting),
        (S::Disconnected, E::StopRequested) => Some(S::Disconnected),
        (S::Disconnecting, E::DisconnectCompleted) => Some(S::Disconnected),
        _ => None,
    }
}

/// Whether producers may hand messages to the wire in this state
pub fn can_publish(state: ConnectionState) -> bool {
    state == ConnectionState::Connected
}

/// Holder of the authoritative state; readers get a watch receiver
#[derive(Debug)]
pub struct ConnectionStateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply an event; invalid events are logged and leave the state unchanged
    pub fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let current = self.current();
        match next_state(current, &event) {
            Some(next) => {
                log_state_transition(current, next, &event);
                self.tx.send_replace(next);
                next
            }
            None => {
                warn!(state = %current, event = ?event, "Ignoring invalid connection transition");
                current
            }
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
    match event {
        ConnectionEvent::ConnectSucceeded => info!("MQTT connection established"),
        ConnectionEvent::ConnectFailed(reason) => warn!("MQTT connect attempt failed: {}", reason),
        ConnectionEvent::ConnectionLost(reason) => warn!("MQTT connection lost: {}", reason),
        _ => debug!("MQTT connection state: {} -> {}", from, to),
    }
}

/// Fixed-interval reconnect policy; retries are unlimited
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Decide what to do after `failed_attempts` consecutive failed connects
    pub fn decide(&self, failed_attempts: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        ReconnectionDecision::Retry {
            attempt: failed_attempts.saturating_add(1),
            delay: self.backoff,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

/// Outcome of a reconnect decision
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Retry { attempt: u32, delay: Duration },
    AbortShutdownRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ConnectionEvent as E;
        use ConnectionState as S;

        assert_eq!(next_state(S::Disconnected, &E::ConnectAttempted), Some(S::Connecting));
        assert_eq!(next_state(S::Connecting, &E::ConnectSucceeded), Some(S::Connected));
        assert_eq!(
            next_state(S::Connected, &E::ConnectionLost("eof".to_string())),
            Some(S::Disconnected)
        );
        assert_eq!(next_state(S::Connected, &E::StopRequested), Some(S::Disconnecting));
        assert_eq!(
            next_state(S::Disconnecting, &E::DisconnectCompleted),
            Some(S::Disconnected)
        );
    }

    #[test]
    fn test_failed_connect_returns_to_disconnected() {
        assert_eq!(
            next_state(
                ConnectionState::Connecting,
                &ConnectionEvent::ConnectFailed("refused".to_string())
            ),
            Some(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_invalid_transitions() {
        use ConnectionEvent as E;
        use ConnectionState as S;

        assert_eq!(next_state(S::Disconnected, &E::ConnectSucceeded), None);
        assert_eq!(next_state(S::Connected, &E::ConnectAttempted), None);
        assert_eq!(next_state(S::Disconnecting, &E::ConnectAttempted), None);
        assert_eq!(next_state(S::Disconnected, &E::ConnectionLost("x".to_string())), None);
    }

    #[test]
    fn test_state_machine_applies_and_broadcasts() {
        let machine = ConnectionStateMachine::new();
        let rx = machine.subscribe();

        assert_eq!(machine.current(), ConnectionState::Disconnected);
        machine.apply(ConnectionEvent::ConnectAttempted);
        machine.apply(ConnectionEvent::ConnectSucceeded);

        assert_eq!(*rx.borrow(), ConnectionState::Connected);
        assert!(can_publish(machine.current()));
    }

    #[test]
    fn test_state_machine_ignores_invalid_event() {
        let machine = ConnectionStateMachine::new();

        let state = machine.apply(ConnectionEvent::ConnectSucceeded);

        assert_eq!(state, ConnectionState::Disconnected);
        assert!(!can_publish(state));
    }

    #[test]
    fn test_reconnect_policy_is_fixed_and_unlimited() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(3000));

        for failed in [0, 1, 10, 10_000] {
            assert_eq!(
                policy.decide(failed, false),
                ReconnectionDecision::Retry {
                    attempt: failed + 1,
                    delay: Duration::from_millis(3000)
                }
            );
        }
        assert_eq!(
            policy.decide(5, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_default_policy_backoff() {
        assert_eq!(ReconnectPolicy::default().backoff, Duration::from_secs(3));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
    }
}
