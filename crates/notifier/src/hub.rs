//! Listener fan-out shared by every transport.
//!
//! Dispatch snapshots the registered listeners and invokes them outside the
//! registry lock, in registration order. Unsubscribing affects dispatches
//! that have not started yet. A panicking listener is logged and skipped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use beacon_common::types::Notification;

pub type NotificationListener = Arc<dyn Fn(&Notification) + Send + Sync>;
pub type StatusListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKey {
    Notification(u64),
    Status(u64),
}

struct Registry {
    next_id: u64,
    notifications: Vec<(u64, NotificationListener)>,
    statuses: Vec<(u64, StatusListener)>,
    connected: bool,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn remove(&mut self, key: ListenerKey) {
        match key {
            ListenerKey::Notification(id) => self.notifications.retain(|(lid, _)| *lid != id),
            ListenerKey::Status(id) => self.statuses.retain(|(lid, _)| *lid != id),
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    /// Keeps status replay and status changes in one total order.
    status_guard: ReentrantMutex<()>,
}

/// Cloneable fan-out hub. One per transport instance.
#[derive(Clone)]
pub struct NotificationHub {
    shared: Arc<Shared>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    next_id: 0,
                    notifications: Vec::new(),
                    statuses: Vec::new(),
                    connected: false,
                }),
                status_guard: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn on_notification<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_notifications(Arc::new(listener))
    }

    pub fn subscribe_notifications(&self, listener: NotificationListener) -> Subscription {
        let mut registry = self.shared.registry.lock();
        let id = registry.next_id();
        registry.notifications.push((id, listener));
        Subscription::new(&self.shared, ListenerKey::Notification(id))
    }

    pub fn on_connection_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.subscribe_status(Arc::new(listener))
    }

    /// Register a status listener. The current status is delivered to it
    /// before this returns and before any later change.
    pub fn subscribe_status(&self, listener: StatusListener) -> Subscription {
        let _order = self.shared.status_guard.lock();
        let (id, current) = {
            let mut registry = self.shared.registry.lock();
            let id = registry.next_id();
            registry.statuses.push((id, listener.clone()));
            (id, registry.connected)
        };

        if catch_unwind(AssertUnwindSafe(|| listener(current))).is_err() {
            tracing::warn!("Status listener panicked during replay");
        }
        Subscription::new(&self.shared, ListenerKey::Status(id))
    }

    /// Deliver `notification` to every registered listener exactly once.
    /// Returns how many listeners were invoked.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let listeners: Vec<NotificationListener> = {
            let registry = self.shared.registry.lock();
            registry
                .notifications
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect()
        };

        tracing::debug!(
            id = %notification.id,
            listeners = listeners.len(),
            "Dispatching notification"
        );

        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(notification))).is_err() {
                tracing::warn!(id = %notification.id, "Notification listener panicked");
            }
        }
        listeners.len()
    }

    /// Record a status change. Listeners fire only when the value changes.
    pub fn set_status(&self, connected: bool) -> bool {
        let _order = self.shared.status_guard.lock();
        let listeners: Vec<StatusListener> = {
            let mut registry = self.shared.registry.lock();
            if registry.connected == connected {
                return false;
            }
            registry.connected = connected;
            registry
                .statuses
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect()
        };

        tracing::info!(connected, "Connection status changed");
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(connected))).is_err() {
                tracing::warn!("Status listener panicked");
            }
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        self.shared.registry.lock().connected
    }

    pub fn notification_listener_count(&self) -> usize {
        self.shared.registry.lock().notifications.len()
    }

    pub fn status_listener_count(&self) -> usize {
        self.shared.registry.lock().statuses.len()
    }
}

/// Registration handle. Dropping it unsubscribes; call [`Subscription::detach`]
/// to keep the listener for the lifetime of the hub.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    shared: Weak<Shared>,
    key: ListenerKey,
    active: bool,
}

impl Subscription {
    fn new(shared: &Arc<Shared>, key: ListenerKey) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            key,
            active: true,
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(shared) = self.shared.upgrade() {
            shared.registry.lock().remove(self.key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}
