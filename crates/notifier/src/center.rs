//! Consumer-facing contract: the list, its unread count, connection status,
//! and the read/clear operations, bound to one transport.
//!
//! Local state changes first; the transport (and through it the store) is
//! told afterwards, so a failing store never loses a read marker or a clear
//! from the local view.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use beacon_common::types::Notification;

use crate::hub::Subscription;
use crate::list::NotificationList;
use crate::transport::NotificationTransport;

/// Rows backfilled on connect.
pub const HISTORY_LIMIT: i64 = 50;

/// Point-in-time view for renderers.
#[derive(Debug, Clone, Serialize)]
pub struct InboxSnapshot {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub connected: bool,
    pub loaded: bool,
}

pub struct NotificationCenter {
    transport: Arc<dyn NotificationTransport>,
    list: Arc<Mutex<NotificationList>>,
    connected: Arc<AtomicBool>,
    loaded: AtomicBool,
    user_id: Mutex<Option<String>>,
    _subscriptions: Vec<Subscription>,
}

impl NotificationCenter {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        let list = Arc::new(Mutex::new(NotificationList::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let on_notification = {
            let list = list.clone();
            transport.on_notification(Arc::new(move |n: &Notification| {
                list.lock().add(n.clone());
            }))
        };
        let on_status = {
            let connected = connected.clone();
            transport.on_connection_status(Arc::new(move |status: bool| {
                connected.store(status, Ordering::SeqCst);
            }))
        };

        Self {
            transport,
            list,
            connected,
            loaded: AtomicBool::new(false),
            user_id: Mutex::new(None),
            _subscriptions: vec![on_notification, on_status],
        }
    }

    pub fn transport(&self) -> &Arc<dyn NotificationTransport> {
        &self.transport
    }

    /// Bind to `user_id` and backfill recent history. Switching users starts
    /// from an empty list.
    pub async fn connect(&self, user_id: &str) {
        let switched = {
            let mut current = self.user_id.lock();
            let switched = current.as_deref().is_some_and(|u| u != user_id);
            *current = Some(user_id.to_string());
            switched
        };
        if switched {
            self.list.lock().clear_all();
            self.loaded.store(false, Ordering::SeqCst);
        }

        self.transport.connect(user_id).await;

        let history = self.transport.history(HISTORY_LIMIT).await;
        let added = self.list.lock().merge_history(history);
        self.loaded.store(true, Ordering::SeqCst);
        tracing::info!(user_id, backfilled = added, transport = self.transport.name(), "Inbox ready");
    }

    /// Explicit retry after the transport gave up, followed by a fresh
    /// backfill to pick up anything stored while offline.
    pub async fn reconnect(&self) -> bool {
        if !self.transport.reconnect().await {
            return false;
        }
        let history = self.transport.history(HISTORY_LIMIT).await;
        let added = self.list.lock().merge_history(history);
        tracing::info!(backfilled = added, transport = self.transport.name(), "Inbox reconnected");
        true
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        *self.user_id.lock() = None;
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.list.lock().sorted()
    }

    pub fn unread_count(&self) -> usize {
        self.list.lock().unread_count()
    }

    pub fn connection_status(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once the first history backfill has completed.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> InboxSnapshot {
        let list = self.list.lock();
        InboxSnapshot {
            notifications: list.sorted(),
            unread_count: list.unread_count(),
            connected: self.connection_status(),
            loaded: self.is_loaded(),
        }
    }

    pub async fn mark_as_read(&self, id: &str) {
        self.list.lock().mark_as_read(id);
        self.transport.mark_as_read(id).await;
    }

    pub async fn mark_all_as_read(&self) {
        self.list.lock().mark_all_as_read();
        self.transport.mark_all_as_read().await;
    }

    pub async fn clear_notification(&self, id: &str) {
        self.list.lock().clear(id);
        self.transport.clear_notification(id).await;
    }

    pub async fn clear_all_notifications(&self) {
        self.list.lock().clear_all();
        self.transport.clear_all_notifications().await;
    }

    /// Synthesize a notification through the transport. It reaches the list
    /// through the same listener path as live traffic.
    pub async fn trigger_test_notification(&self) -> Notification {
        self.transport.trigger_demo_notification().await
    }
}
