//! End-to-end fanout tests over the in-memory adapters
//!
//! Exercises the full path: bus event -> coordinator -> subscriber lookup ->
//! push delivery -> watermark advancement, including gone-connection reaping
//! and retry exhaustion.

use std::sync::Arc;

use gateway_fanout::{
    ChangeBus, ConnectionStore, FanoutCoordinator, InMemoryChangeBus, InMemoryConnectionSender,
    InMemoryConnectionStore, RetryPolicy, StateChangeNotification,
};
use tokio::time::Duration;
use uuid::Uuid;

struct Harness {
    store: Arc<InMemoryConnectionStore>,
    sender: Arc<InMemoryConnectionSender>,
    bus: InMemoryChangeBus,
    coordinator: FanoutCoordinator,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryConnectionStore::new());
    let sender = Arc::new(InMemoryConnectionSender::new());
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        shed_after: 2,
    };
    let coordinator = FanoutCoordinator::with_retry_policy(store.clone(), sender.clone(), retry);

    Harness {
        store,
        sender,
        bus: InMemoryChangeBus::new(),
        coordinator,
    }
}

async fn connect_and_subscribe(h: &Harness, connection_id: &str, actor_id: &str, watermark: u64) {
    h.sender.open(connection_id);
    h.store.register(connection_id, None).await.unwrap();
    h.store
        .subscribe(connection_id, Uuid::new_v4(), actor_id, watermark)
        .await
        .unwrap();
}

/// Pump every event currently in the receiver through the coordinator
async fn drain(
    h: &Harness,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<StateChangeNotification>,
) {
    while let Ok(change) = rx.try_recv() {
        h.coordinator.handle_notification(&change).await;
    }
}

#[tokio::test]
async fn test_change_flows_from_bus_to_connection() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();

    connect_and_subscribe(&h, "c1", "todos", 0).await;

    h.bus
        .notify(&StateChangeNotification::new("todos", 5))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    let delivered = h.sender.delivered("c1");
    assert_eq!(delivered.len(), 1);

    // The payload on the wire is the encoded notification itself
    let decoded: StateChangeNotification = serde_json::from_slice(&delivered[0]).unwrap();
    assert_eq!(decoded.actor_id, "todos");
    assert_eq!(decoded.sequence_number, 5);

    assert_eq!(h.store.get("c1").unwrap().last_sequence, 5);
}

#[tokio::test]
async fn test_reordered_events_do_not_regress_or_redeliver() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();

    connect_and_subscribe(&h, "c1", "todos", 0).await;

    h.bus
        .notify(&StateChangeNotification::new("todos", 5))
        .await
        .unwrap();
    h.bus
        .notify(&StateChangeNotification::new("todos", 3))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    // Only the first event is delivered; the stale one is skipped entirely
    assert_eq!(h.sender.delivered("c1").len(), 1);
    assert_eq!(h.store.get("c1").unwrap().last_sequence, 5);
}

#[tokio::test]
async fn test_fanout_reaches_only_subscribers_of_the_actor() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();

    connect_and_subscribe(&h, "c1", "todos", 0).await;
    connect_and_subscribe(&h, "c2", "todos", 0).await;
    connect_and_subscribe(&h, "c3", "notes", 0).await;

    h.bus
        .notify(&StateChangeNotification::new("todos", 1))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    assert_eq!(h.sender.delivered("c1").len(), 1);
    assert_eq!(h.sender.delivered("c2").len(), 1);
    assert!(h.sender.delivered("c3").is_empty());
}

#[tokio::test]
async fn test_gone_connection_is_reaped_during_fanout() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();

    connect_and_subscribe(&h, "gone", "todos", 0).await;
    connect_and_subscribe(&h, "live", "todos", 0).await;
    h.sender.close("gone");

    h.bus
        .notify(&StateChangeNotification::new("todos", 1))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    // The closed connection is removed from the registry; the live one got
    // its delivery regardless
    assert!(h.store.get("gone").is_none());
    assert_eq!(h.sender.delivered("live").len(), 1);
    assert_eq!(h.store.get("live").unwrap().last_sequence, 1);
}

#[tokio::test]
async fn test_retry_exhaustion_does_not_stop_the_fanout() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();

    connect_and_subscribe(&h, "flaky", "todos", 0).await;
    connect_and_subscribe(&h, "steady", "todos", 0).await;
    h.sender.inject_failures("flaky", 100);

    h.bus
        .notify(&StateChangeNotification::new("todos", 1))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    assert!(h.sender.delivered("flaky").is_empty());
    assert_eq!(h.sender.delivered("steady").len(), 1);

    // The failed connection keeps its watermark; the next event for this
    // actor will try it again
    assert_eq!(h.store.get("flaky").unwrap().last_sequence, 0);
}

#[tokio::test]
async fn test_reconnect_resumes_from_stored_watermark() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();

    connect_and_subscribe(&h, "c1", "todos", 0).await;
    h.bus
        .notify(&StateChangeNotification::new("todos", 4))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    // Client drops and reconnects with a new connection id, passing the
    // watermark it had observed
    let watermark = h.store.get("c1").unwrap().last_sequence;
    h.store.unregister("c1").await.unwrap();
    connect_and_subscribe(&h, "c2", "todos", watermark).await;

    // An event at the same sequence is not replayed to the reconnected client
    h.bus
        .notify(&StateChangeNotification::new("todos", 4))
        .await
        .unwrap();
    drain(&h, &mut rx).await;
    assert!(h.sender.delivered("c2").is_empty());

    h.bus
        .notify(&StateChangeNotification::new("todos", 6))
        .await
        .unwrap();
    drain(&h, &mut rx).await;
    assert_eq!(h.sender.delivered("c2").len(), 1);
    assert_eq!(h.store.get("c2").unwrap().last_sequence, 6);
}

#[tokio::test]
async fn test_metrics_track_fanout_outcomes() {
    let h = harness();
    let mut rx = h.bus.start().await.unwrap();
    let metrics = h.coordinator.metrics();

    connect_and_subscribe(&h, "ok", "todos", 0).await;
    connect_and_subscribe(&h, "bad", "todos", 0).await;
    h.sender.inject_failures("bad", 100);

    h.bus
        .notify(&StateChangeNotification::new("todos", 1))
        .await
        .unwrap();
    h.bus
        .notify(&StateChangeNotification::new("todos", 2))
        .await
        .unwrap();
    drain(&h, &mut rx).await;

    assert_eq!(metrics.notifications_processed(), 2);
    assert_eq!(metrics.deliveries(), 2);
    assert_eq!(metrics.delivery_failures(), 2);
    // shed_after = 2, so the failing connection was reaped on the second
    // fanout
    assert_eq!(metrics.connections_reaped(), 1);
}
