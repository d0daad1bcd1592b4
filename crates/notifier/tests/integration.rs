//! End-to-end tests of both transports and the inbox, on a paused clock.
//!
//! The simulated transport runs against the in-memory reference peer and the
//! persistent transport against the in-memory store, so no server or
//! database is needed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use beacon_common::config::{ReconnectPolicy, SimulationConfig};
use beacon_common::types::{Envelope, Notification};
use beacon_connection::{ConnectionState, MockConnector};
use beacon_notifier::{
    MemoryNotificationStore, NotificationCenter, NotificationTransport, PersistentTransport,
    SimulatedTransport,
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

/// Walk the full 1/2/4/8/16 s retry schedule.
async fn exhaust_schedule() {
    for gap in [1000, 2000, 4000, 8000, 16000] {
        advance(gap).await;
    }
}

fn simulated() -> (MockConnector, Arc<SimulatedTransport>) {
    let connector = MockConnector::new();
    let transport = Arc::new(SimulatedTransport::new(
        Arc::new(connector.clone()),
        "mock://server",
        ReconnectPolicy::default(),
        SimulationConfig::disabled(),
    ));
    (connector, transport)
}

fn persistent() -> (
    Arc<MemoryNotificationStore>,
    Arc<PersistentTransport<MemoryNotificationStore>>,
) {
    let store = Arc::new(MemoryNotificationStore::new());
    let transport = Arc::new(PersistentTransport::new(
        store.clone(),
        ReconnectPolicy::default(),
    ));
    (store, transport)
}

fn record_notifications(
    transport: &dyn NotificationTransport,
) -> (Arc<Mutex<Vec<Notification>>>, beacon_notifier::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = transport.hub().on_notification(move |n| sink.lock().push(n.clone()));
    (seen, sub)
}

fn record_status(
    transport: &dyn NotificationTransport,
) -> (Arc<Mutex<Vec<bool>>>, beacon_notifier::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = transport.hub().on_connection_status(move |s| sink.lock().push(s));
    (seen, sub)
}

// ============================================================
// Dispatch fan-out
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_demo_reaches_every_listener_once_in_order() {
    let (_connector, transport) = simulated();
    let order = Arc::new(Mutex::new(Vec::new()));

    let subs: Vec<_> = (0..5)
        .map(|i| {
            let order = order.clone();
            transport.hub().on_notification(move |_| order.lock().push(i))
        })
        .collect();

    transport.trigger_demo_notification().await;

    assert_eq!(order.lock().as_slice(), &[0, 1, 2, 3, 4]);
    drop(subs);
}

#[tokio::test(start_paused = true)]
async fn test_throwing_listener_does_not_stop_dispatch() {
    let (_connector, transport) = simulated();
    let (seen_before, _a) = record_notifications(transport.as_ref());
    let _b = transport.hub().on_notification(|_| panic!("badge renderer crashed"));
    let (seen_after, _c) = record_notifications(transport.as_ref());

    transport.trigger_demo_notification().await;

    assert_eq!(seen_before.lock().len(), 1);
    assert_eq!(seen_after.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_demo_dispatches_while_offline() {
    let (_connector, transport) = simulated();
    let (seen, _sub) = record_notifications(transport.as_ref());

    assert!(!transport.is_connected());
    transport.trigger_demo_notification().await;
    assert_eq!(seen.lock().len(), 1);
}

// ============================================================
// Simulated transport scenarios
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_connect_then_demo_addresses_user() {
    let (_connector, transport) = simulated();
    let (seen, _sub) = record_notifications(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;
    assert!(transport.is_connected());

    transport.trigger_demo_notification().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].recipient.as_deref(), Some("user-1"));
}

#[tokio::test(start_paused = true)]
async fn test_forced_disconnect_reports_offline_then_online() {
    let (connector, transport) = simulated();
    let (statuses, _sub) = record_status(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;
    assert_eq!(statuses.lock().as_slice(), &[false, true]);

    assert!(connector.drop_connection());
    settle().await;
    assert_eq!(statuses.lock().as_slice(), &[false, true, false]);

    advance(999).await;
    assert_eq!(statuses.lock().len(), 3);
    advance(1).await;
    assert_eq!(statuses.lock().as_slice(), &[false, true, false, true]);

    // Resubscribed on the new link
    assert_eq!(connector.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_push_reaches_listeners() {
    let (connector, transport) = simulated();
    let (seen, _sub) = record_notifications(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;

    let pushed = Notification::new("Invoice paid", "INV-2211");
    connector.push(&Envelope::Notification {
        channel: Some("user:user-1".to_string()),
        notification: pushed.clone(),
    });
    settle().await;

    assert_eq!(seen.lock().as_slice(), &[pushed]);
}

#[tokio::test(start_paused = true)]
async fn test_center_reconnect_recovers_from_failed() {
    let (connector, transport) = simulated();
    connector.set_reachable(false);
    let center = NotificationCenter::new(transport.clone());

    center.connect("user-1").await;
    settle().await;
    exhaust_schedule().await;
    assert_eq!(transport.manager().state(), ConnectionState::Failed);
    assert_eq!(connector.open_attempts(), 6);
    assert!(!center.connection_status());

    connector.set_reachable(true);
    assert!(center.reconnect().await);
    settle().await;

    assert_eq!(transport.manager().state(), ConnectionState::Connected);
    assert!(center.connection_status());
    // Subscribed on the new link
    assert_eq!(connector.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_same_user_restarts_failed_link() {
    let (connector, transport) = simulated();
    connector.set_reachable(false);

    transport.connect("user-1").await;
    settle().await;
    exhaust_schedule().await;
    assert_eq!(transport.manager().state(), ConnectionState::Failed);

    connector.set_reachable(true);
    transport.connect("user-1").await;
    settle().await;
    assert_eq!(transport.manager().state(), ConnectionState::Connected);
    assert_eq!(connector.opened(), 1);

    // A healthy link is left alone
    transport.connect("user-1").await;
    settle().await;
    assert_eq!(connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_while_unbound_is_refused() {
    let (connector, transport) = simulated();
    assert!(!transport.reconnect().await);
    settle().await;
    assert_eq!(connector.open_attempts(), 0);

    let (_store, persistent) = persistent();
    assert!(!persistent.reconnect().await);
}

// ============================================================
// Inbox
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_mark_all_as_read_clears_unread() {
    let (_connector, transport) = simulated();
    let center = NotificationCenter::new(transport);
    center.connect("user-1").await;
    settle().await;

    for _ in 0..4 {
        center.trigger_test_notification().await;
    }
    let first = center.notifications()[0].id.clone();
    center.mark_as_read(&first).await;
    assert_eq!(center.unread_count(), 3);

    center.mark_all_as_read().await;
    assert_eq!(center.unread_count(), 0);
    assert_eq!(center.notifications().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_clear_all_then_demo_yields_one_item() {
    let (_connector, transport) = simulated();
    let center = NotificationCenter::new(transport);
    center.connect("user-1").await;

    center.trigger_test_notification().await;
    center.trigger_test_notification().await;
    center.clear_all_notifications().await;
    center.trigger_test_notification().await;

    assert_eq!(center.notifications().len(), 1);
    assert_eq!(center.unread_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clear_absent_id_is_noop() {
    let (_connector, transport) = simulated();
    let center = NotificationCenter::new(transport);

    let n = center.trigger_test_notification().await;
    center.clear_notification("does-not-exist").await;
    center.clear_notification(&n.id).await;
    center.clear_notification(&n.id).await;

    assert!(center.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_center_tracks_connection_status() {
    let (connector, transport) = simulated();
    let center = NotificationCenter::new(transport);

    center.connect("user-1").await;
    settle().await;
    assert!(center.connection_status());

    connector.drop_connection();
    settle().await;
    assert!(!center.connection_status());
}

#[tokio::test(start_paused = true)]
async fn test_switching_user_starts_empty() {
    let (store, transport) = persistent();
    store.insert_external("alice", &Notification::new("for alice", "m"));
    store.insert_external("bob", &Notification::new("for bob", "m"));

    let center = NotificationCenter::new(transport);
    center.connect("alice").await;
    assert_eq!(center.notifications().len(), 1);

    center.connect("bob").await;
    let titles: Vec<String> = center.notifications().into_iter().map(|n| n.title).collect();
    assert_eq!(titles, vec!["for bob"]);
}

// ============================================================
// Persistent transport
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_persistent_backfills_history() {
    let (store, transport) = persistent();
    for i in 0..3 {
        store.insert_external("user-1", &Notification::new(format!("n{}", i), "m"));
    }

    let center = NotificationCenter::new(transport);
    center.connect("user-1").await;

    assert!(center.is_loaded());
    assert_eq!(center.notifications().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_delivers_external_inserts() {
    let (store, transport) = persistent();
    let (seen, _sub) = record_notifications(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;
    assert!(transport.is_connected());

    store.insert_external("user-1", &Notification::new("from elsewhere", "m"));
    store.insert_external("user-2", &Notification::new("not mine", "m"));
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].title, "from elsewhere");
}

#[tokio::test(start_paused = true)]
async fn test_persistent_local_write_is_not_echoed() {
    let (store, transport) = persistent();
    let (seen, _sub) = record_notifications(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;

    let n = transport.trigger_demo_notification().await;
    settle().await;

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(store.rows("user-1").len(), 1);
    assert_eq!(store.rows("user-1")[0].id, n.id);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_does_not_block_dispatch() {
    let (store, transport) = persistent();
    store.set_available(false);

    let center = NotificationCenter::new(transport);
    center.connect("user-1").await;
    settle().await;

    let n = center.trigger_test_notification().await;
    assert_eq!(center.notifications().len(), 1);

    center.mark_as_read(&n.id).await;
    assert_eq!(center.unread_count(), 0);
    assert!(store.rows("user-1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_ops_are_idempotent() {
    let (store, transport) = persistent();
    transport.connect("user-1").await;
    settle().await;

    let n = transport.trigger_demo_notification().await;
    transport.add_notification(n.clone()).await;
    assert_eq!(store.rows("user-1").len(), 1);

    transport.mark_as_read(&n.id).await;
    transport.mark_as_read(&n.id).await;
    assert!(store.rows("user-1")[0].read);

    transport.clear_notification(&n.id).await;
    transport.clear_notification(&n.id).await;
    transport.clear_all_notifications().await;
    assert!(store.rows("user-1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_feed_resubscribes() {
    let (store, transport) = persistent();
    let (statuses, _sub) = record_status(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;
    assert_eq!(statuses.lock().as_slice(), &[false, true]);

    store.close_feeds();
    settle().await;
    assert_eq!(statuses.lock().as_slice(), &[false, true, false]);
    assert_eq!(store.feed_subscribers(), 0);

    advance(1000).await;
    assert_eq!(statuses.lock().as_slice(), &[false, true, false, true]);
    assert_eq!(store.feed_subscribers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_disconnect_stops_feed() {
    let (store, transport) = persistent();
    let (seen, _sub) = record_notifications(transport.as_ref());

    transport.connect("user-1").await;
    settle().await;
    transport.disconnect().await;
    settle().await;

    store.insert_external("user-1", &Notification::new("late", "m"));
    settle().await;

    assert!(seen.lock().is_empty());
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_feed_gives_up_then_reconnects() {
    let (store, transport) = persistent();
    let (statuses, _sub) = record_status(transport.as_ref());
    store.set_available(false);
    let center = NotificationCenter::new(transport.clone());

    center.connect("user-1").await;
    settle().await;
    assert_eq!(store.watch_attempts(), 1);

    exhaust_schedule().await;
    assert_eq!(store.watch_attempts(), 6);

    // Given up: nothing further is attempted
    advance(120_000).await;
    assert_eq!(store.watch_attempts(), 6);
    assert_eq!(statuses.lock().as_slice(), &[false]);
    assert!(!center.connection_status());

    store.set_available(true);
    store.insert_external("user-1", &Notification::new("stored while offline", "m"));
    assert!(center.reconnect().await);
    settle().await;

    assert_eq!(store.watch_attempts(), 7);
    assert!(center.connection_status());
    assert_eq!(statuses.lock().as_slice(), &[false, true]);
    assert_eq!(center.notifications().len(), 1);

    store.insert_external("user-1", &Notification::new("live", "m"));
    settle().await;
    assert_eq!(center.notifications().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_connect_same_user_restarts_finished_feed() {
    let (store, transport) = persistent();
    store.set_available(false);

    transport.connect("user-1").await;
    settle().await;
    exhaust_schedule().await;
    assert_eq!(store.watch_attempts(), 6);

    store.set_available(true);
    transport.connect("user-1").await;
    settle().await;
    assert_eq!(store.watch_attempts(), 7);
    assert!(transport.is_connected());

    // Feed still running: no resubscribe
    transport.connect("user-1").await;
    settle().await;
    assert_eq!(store.watch_attempts(), 7);
    assert_eq!(store.feed_subscribers(), 1);
}
