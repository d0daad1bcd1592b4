//! Reconnection timeline tests against the in-memory peer.
//!
//! All tests run on a paused clock, so the full 1s/2s/4s/8s/16s schedule
//! completes instantly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use beacon_common::config::ReconnectPolicy;
use beacon_common::types::{Envelope, user_channel};
use beacon_connection::{
    CloseInfo, ConnectionEvent, ConnectionManager, ConnectionState, EventKind, MockConnector,
};

// ============================================================
// Shared helpers
// ============================================================

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn advance(millis: u64) {
    tokio::time::advance(Duration::from_millis(millis)).await;
    settle().await;
}

fn setup() -> (MockConnector, ConnectionManager) {
    let connector = MockConnector::new();
    let manager = ConnectionManager::new(Arc::new(connector.clone()), ReconnectPolicy::default());
    (connector, manager)
}

fn record(manager: &ConnectionManager, kind: EventKind) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.on(kind, move |e| sink.lock().push(e.clone()));
    events
}

// ============================================================
// Backoff schedule
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_retry_schedule_then_failed() {
    let (connector, manager) = setup();
    connector.set_reachable(false);

    manager.connect("mock://server");
    settle().await;
    assert_eq!(connector.open_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });

    // Retries land at t = 1, 3, 7, 15, 31 seconds
    for (gap, expected_attempts) in [(1000, 2), (2000, 3), (4000, 4), (8000, 5), (16000, 6)] {
        advance(gap - 1).await;
        assert_eq!(connector.open_attempts(), expected_attempts - 1);
        advance(1).await;
        assert_eq!(connector.open_attempts(), expected_attempts);
    }

    assert_eq!(manager.state(), ConnectionState::Failed);

    // Nothing further is scheduled once failed
    advance(120_000).await;
    assert_eq!(connector.open_attempts(), 6);
    assert_eq!(connector.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_successful_open_resets_attempts() {
    let (connector, manager) = setup();
    connector.set_reachable(false);

    manager.connect("mock://server");
    settle().await;
    advance(1000).await;
    assert_eq!(manager.attempt(), 2);

    connector.set_reachable(true);
    advance(2000).await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.attempt(), 0);

    // A fresh loss restarts the schedule at 1s, not 4s
    assert!(connector.drop_connection());
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });
    advance(1000).await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(connector.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_leaves_failed() {
    let (connector, manager) = setup();
    connector.set_reachable(false);

    manager.connect("mock://server");
    settle().await;
    for gap in [1000, 2000, 4000, 8000, 16000] {
        advance(gap).await;
    }
    assert_eq!(manager.state(), ConnectionState::Failed);

    connector.set_reachable(true);
    assert!(manager.reconnect());
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.attempt(), 0);
}

// ============================================================
// Lifecycle events
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_fires_close_then_open() {
    let (connector, manager) = setup();
    let opens = record(&manager, EventKind::Open);
    let closes = record(&manager, EventKind::Close);

    manager.connect("mock://server");
    settle().await;
    assert_eq!(opens.lock().len(), 1);

    connector.drop_connection();
    settle().await;
    assert_eq!(
        closes.lock().as_slice(),
        &[ConnectionEvent::Close(CloseInfo::abnormal(
            "connection reset by peer"
        ))]
    );

    advance(1000).await;
    assert_eq!(opens.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_does_not_fire_close() {
    let (connector, manager) = setup();
    connector.set_reachable(false);
    let closes = record(&manager, EventKind::Close);

    manager.connect("mock://server");
    settle().await;
    advance(1000).await;

    assert!(closes.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_simulate_disconnect_reconnects() {
    let (connector, manager) = setup();
    let closes = record(&manager, EventKind::Close);

    manager.connect("mock://server");
    settle().await;
    assert!(manager.simulate_disconnect("chaos"));

    assert_eq!(
        closes.lock().as_slice(),
        &[ConnectionEvent::Close(CloseInfo::abnormal("chaos"))]
    );
    assert!(!manager.is_connected());

    advance(1000).await;
    assert!(manager.is_connected());
    assert_eq!(connector.opened(), 2);

    // Only meaningful while connected
    manager.close();
    assert!(!manager.simulate_disconnect("chaos"));
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_reconnect() {
    let (connector, manager) = setup();

    manager.connect("mock://server");
    settle().await;
    connector.drop_connection();
    settle().await;

    manager.close();
    advance(60_000).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.open_attempts(), 1);
}

// ============================================================
// Subscribe handshake
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_subscribe_on_open_is_acknowledged() {
    let (connector, manager) = setup();
    let messages = record(&manager, EventKind::Message);

    let weak = manager.downgrade();
    manager.on(EventKind::Open, move |_| {
        if let Some(manager) = weak.upgrade() {
            let subscribe = Envelope::Subscribe {
                channel: user_channel("u1"),
            };
            manager.send(subscribe.to_json().unwrap());
        }
    });

    manager.connect("mock://server");
    settle().await;
    assert_eq!(connector.sent().len(), 1);
    assert!(messages.lock().is_empty());

    advance(100).await;
    let messages = messages.lock();
    assert_eq!(messages.len(), 1);
    let ConnectionEvent::Message(text) = &messages[0] else {
        panic!("expected a message event");
    };
    assert!(matches!(
        Envelope::from_json(text).unwrap(),
        Envelope::SubscriptionSuccess { channel: Some(ref c), .. } if c == "user:u1"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_reconnect() {
    let (connector, manager) = setup();

    let weak = manager.downgrade();
    manager.on(EventKind::Open, move |_| {
        if let Some(manager) = weak.upgrade() {
            manager.send(r#"{"type":"subscribe","channel":"user:u1"}"#);
        }
    });

    manager.connect("mock://server");
    settle().await;
    connector.drop_connection();
    settle().await;
    advance(1000).await;

    assert_eq!(connector.sent().len(), 2);
}
