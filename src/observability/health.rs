//! Health check HTTP server for container orchestration
//!
//! `/health` reports the broker connection and outbox backlog, `/ready` and
//! `/live` serve as health checks, `/metrics` exports a [`MetricsSnapshot`].

use crate::observability::metrics::{current_timestamp, BusMetrics, MetricsSnapshot};
use crate::outbox::DurableOutbox;
use crate::supervisor::state::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server for one bus
pub struct HealthServer {
    client_id: String,
    port: u16,
    state: watch::Receiver<ConnectionState>,
    metrics: Arc<BusMetrics>,
    outbox: DurableOutbox,
}

impl HealthServer {
    pub fn new(
        client_id: impl Into<String>,
        port: u16,
        state: watch::Receiver<ConnectionState>,
        metrics: Arc<BusMetrics>,
        outbox: DurableOutbox,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            port,
            state,
            metrics,
            outbox,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        let routes = self.routes();

        tracing::info!("Starting health server on port {}", port);
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    }

    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let metrics_server = self.clone();
        let ready_server = self.clone();

        // GET /health - connection and outbox status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = metrics_server.clone();
                async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics_snapshot().await)) }
            });

        // GET /ready - readiness check
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.connected();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
                }
            });

        // GET /live - liveness check
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Connection and outbox status"),
                ("/metrics", "Counters for connections, publishing and dispatch"),
                ("/ready", "Readiness check"),
                ("/live", "Liveness check"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let backlog = self.outbox.backlog().await.ok().map(|n| n as u64);
        self.metrics.snapshot(*self.state.borrow(), backlog)
    }

    async fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let state = *self.state.borrow();

        let mut checks = BTreeMap::new();
        checks.insert("mqtt", self.check_connection(state, now));

        let backlog = match self.outbox.backlog().await {
            Ok(backlog) => {
                checks.insert(
                    "outbox",
                    HealthCheck {
                        status: "healthy".to_string(),
                        message: Some(format!("{backlog} unconfirmed event(s)")),
                        last_check: now,
                    },
                );
                Some(backlog)
            }
            Err(e) => {
                checks.insert(
                    "outbox",
                    HealthCheck {
                        status: "unhealthy".to_string(),
                        message: Some(format!("Event store unavailable: {e}")),
                        last_check: now,
                    },
                );
                None
            }
        };

        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            client_id: self.client_id.clone(),
            connection_state: state,
            outbox_backlog: backlog,
            uptime_seconds: self.metrics.snapshot(state, None).uptime_seconds,
            checks,
        }
    }

    fn check_connection(&self, state: ConnectionState, now: u64) -> HealthCheck {
        if state == ConnectionState::Connected {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("MQTT connection established".to_string()),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(format!("MQTT connection {state}")),
                last_check: now,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    client_id: String,
    connection_state: ConnectionState,
    outbox_backlog: Option<usize>,
    uptime_seconds: u64,
    checks: BTreeMap<&'static str, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};
    use crate::supervisor::state::{ConnectionEvent, ConnectionStateMachine};
    use crate::testing::FailingStore;

    fn server_with(store: SharedStore) -> (Arc<HealthServer>, ConnectionStateMachine, DurableOutbox) {
        let machine = ConnectionStateMachine::new();
        let outbox = DurableOutbox::new(store);
        let server = Arc::new(HealthServer::new(
            "health-test",
            8080,
            machine.subscribe(),
            Arc::new(BusMetrics::new()),
            outbox.clone(),
        ));
        (server, machine, outbox)
    }

    fn connect(machine: &ConnectionStateMachine) {
        machine.apply(ConnectionEvent::ConnectAttempted);
        machine.apply(ConnectionEvent::ConnectSucceeded);
    }

    async fn get(server: &Arc<HealthServer>, path: &str) -> (StatusCode, serde_json::Value) {
        let response = warp::test::request()
            .method("GET")
            .path(path)
            .reply(&server.routes())
            .await;
        let body = serde_json::from_slice(response.body()).unwrap();
        (response.status(), body)
    }

    #[tokio::test]
    async fn test_health_unavailable_while_disconnected() {
        let (server, _machine, _outbox) = server_with(Arc::new(MemoryStore::new()));

        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["connection_state"], "disconnected");
        assert_eq!(body["checks"]["mqtt"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_health_reports_backlog_when_connected() {
        let (server, machine, outbox) = server_with(Arc::new(MemoryStore::new()));
        outbox.record("a/b", b"1").await.unwrap();
        outbox.record("a/c", b"2").await.unwrap();
        connect(&machine);

        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["client_id"], "health-test");
        assert_eq!(body["outbox_backlog"], 2);
    }

    #[tokio::test]
    async fn test_health_degraded_when_store_fails() {
        let store = Arc::new(FailingStore::new());
        store.set_fail_reads(true);
        let (server, machine, _outbox) = server_with(store);
        connect(&machine);

        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["outbox"]["status"], "unhealthy");
        assert!(body["outbox_backlog"].is_null());
    }

    #[tokio::test]
    async fn test_ready_follows_connection_state() {
        let (server, machine, _outbox) = server_with(Arc::new(MemoryStore::new()));

        let (status, body) = get(&server, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);

        connect(&machine);
        let (status, body) = get(&server, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_live_and_index() {
        let (server, _machine, _outbox) = server_with(Arc::new(MemoryStore::new()));

        let (status, body) = get(&server, "/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alive"], true);

        let (status, body) = get(&server, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["endpoints"]["/metrics"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (server, machine, outbox) = server_with(Arc::new(MemoryStore::new()));
        outbox.record("a/b", b"1").await.unwrap();
        connect(&machine);

        let (status, body) = get(&server, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connection"]["state"], "connected");
        assert_eq!(body["publishing"]["outbox_backlog"], 1);
    }
}
