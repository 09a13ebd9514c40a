//! Undelivered events survive a restart when the document store is used


use mqtt_integration_helpers::{eventually, mock_bus_with_store};
use mqttbus::store::{DocumentStore, EventFilter, EventStatus, EventStore};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_failed_events_replayed_by_next_process() {
    // Arrange: first "process" publishes while offline
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("outbox").join("events.json");
    let first_ids = {
        let store = Arc::new(DocumentStore::open(&path).await.unwrap());
        let (bus, _wire) = mock_bus_with_store(store);
        vec![
            bus.publish("invoices/1", "a").await.unwrap(),
            bus.publish("invoices/2", "b").await.unwrap(),
        ]
    };

    // Act: second "process" opens the same document and connects
    let store = Arc::new(DocumentStore::open(&path).await.unwrap());
    assert_eq!(store.count().await.unwrap(), 2);
    let (bus, wire) = mock_bus_with_store(store.clone());
    bus.start().await.unwrap();

    // Assert: both events delivered in creation order under their original ids
    let outbox = bus.outbox().clone();
    assert!(
        eventually(|| {
            let outbox = outbox.clone();
            async move { outbox.backlog().await.ok() == Some(0) }
        })
        .await
    );
    let topics: Vec<String> = wire.delivered().await.into_iter().map(|(t, _)| t).collect();
    assert_eq!(topics, vec!["invoices/1", "invoices/2"]);
    for id in &first_ids {
        let record = store.get(*id).await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Sent);
        assert_eq!(record.attempts, 2);
    }
    assert_eq!(store.count().await.unwrap(), 2);

    bus.stop().await;

    // The confirmed state is on disk too
    let reopened = DocumentStore::open(&path).await.unwrap();
    let statuses: Vec<EventStatus> = reopened
        .query(&EventFilter::all())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![EventStatus::Sent, EventStatus::Sent]);
}
