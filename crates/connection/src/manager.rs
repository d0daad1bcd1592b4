//! Connection manager: owns one live link and its reconnection loop.
//!
//! Lifecycle: `Disconnected → Connecting → Connected`. An abnormal close moves
//! to `Reconnecting`, retried on the [`Backoff`] schedule; once the policy is
//! exhausted the manager parks in `Failed` until [`ConnectionManager::reconnect`]
//! or [`ConnectionManager::connect`] is called.
//!
//! Every open/close/reconnect bumps a cycle counter. Frames read by a task
//! whose cycle is no longer current are discarded, so a message can never be
//! delivered after the `close` of the cycle it arrived on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use beacon_common::config::ReconnectPolicy;

use crate::backoff::Backoff;
use crate::connector::{CloseInfo, Connector, Frame, Link};

/// Event names a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Message,
}

/// A lifecycle or message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Close(CloseInfo),
    Message(String),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Open => EventKind::Open,
            ConnectionEvent::Close(_) => EventKind::Close,
            ConnectionEvent::Message(_) => EventKind::Message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

/// Handle returned by [`ConnectionManager::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type EventCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    endpoint: Option<String>,
    backoff: Backoff,
    cycle: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    listeners: Vec<(ListenerId, EventKind, EventCallback)>,
    next_listener: u64,
}

impl Inner {
    /// Invalidate the current cycle and release its resources.
    fn teardown(&mut self) {
        self.cycle += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Serialises event emission across threads. Re-entrant so a listener may
    /// call `close()` or `send()` from inside its own callback.
    emit_guard: ReentrantMutex<()>,
    connector: Arc<dyn Connector>,
}

/// Cloneable handle to a single managed connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Non-owning handle, for listeners that need to call back into the manager.
#[derive(Clone)]
pub struct WeakConnectionManager {
    shared: Weak<Shared>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.shared.upgrade().map(|shared| ConnectionManager { shared })
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    backoff: Backoff::new(policy),
                    cycle: 0,
                    outbound: None,
                    task: None,
                    listeners: Vec::new(),
                    next_listener: 0,
                }),
                emit_guard: ReentrantMutex::new(()),
                connector,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register a callback. Repeated registrations are kept as-is; each one
    /// fires on every matching event, in registration order.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, kind, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.shared.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Begin a session with `endpoint`.
    ///
    /// Already connected (or connecting) to the same endpoint: no-op. Bound to
    /// a different endpoint: the existing link is closed normally first, so at
    /// most one link is ever open. Must be called inside a tokio runtime.
    pub fn connect(&self, endpoint: &str) {
        let _emit = self.shared.emit_guard.lock();

        let (was_connected, cycle) = {
            let mut inner = self.shared.inner.lock();
            let active = matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if active && inner.endpoint.as_deref() == Some(endpoint) {
                tracing::debug!(endpoint, "Already connected, ignoring connect");
                return;
            }

            let was_connected = inner.state == ConnectionState::Connected;
            inner.teardown();
            inner.endpoint = Some(endpoint.to_string());
            inner.backoff.reset();
            inner.state = ConnectionState::Connecting;
            (was_connected, inner.cycle)
        };

        if was_connected {
            tracing::info!(endpoint, "Replacing existing connection");
            self.emit(&ConnectionEvent::Close(CloseInfo::normal()));
        }

        self.start_cycle(cycle, Duration::ZERO);
    }

    /// Manual retry: reopen the last endpoint with a fresh backoff schedule.
    /// This is the only way out of `Failed`. Returns false when `connect` was
    /// never called.
    pub fn reconnect(&self) -> bool {
        let _emit = self.shared.emit_guard.lock();

        let (was_connected, cycle) = {
            let mut inner = self.shared.inner.lock();
            if inner.endpoint.is_none() {
                return false;
            }
            let was_connected = inner.state == ConnectionState::Connected;
            inner.teardown();
            inner.backoff.reset();
            inner.state = ConnectionState::Connecting;
            (was_connected, inner.cycle)
        };

        if was_connected {
            self.emit(&ConnectionEvent::Close(CloseInfo::normal()));
        }

        tracing::info!("Manual reconnect requested");
        self.start_cycle(cycle, Duration::ZERO);
        true
    }

    /// Send a text payload. Dropped with a warning when not connected.
    pub fn send(&self, payload: impl Into<String>) {
        let inner = self.shared.inner.lock();
        match (&inner.state, &inner.outbound) {
            (ConnectionState::Connected, Some(outbound)) => {
                if outbound.send(payload.into()).is_err() {
                    tracing::warn!("Link closed before send, dropping message");
                }
            }
            (state, _) => {
                tracing::warn!(state = ?state, "Not connected, dropping message");
            }
        }
    }

    /// Deliberate shutdown. Fires `close` with a normal-closure reason if a
    /// link was open and cancels any pending reconnect.
    pub fn close(&self) {
        let _emit = self.shared.emit_guard.lock();

        let was_connected = {
            let mut inner = self.shared.inner.lock();
            let was_connected = inner.state == ConnectionState::Connected;
            inner.teardown();
            inner.state = ConnectionState::Disconnected;
            inner.backoff.reset();
            was_connected
        };

        if was_connected {
            tracing::info!("Connection closed");
            self.emit(&ConnectionEvent::Close(CloseInfo::normal()));
        }
    }

    /// Treat the open link as lost (network error, forced disconnect).
    /// Fires an abnormal `close` and enters the reconnection loop.
    pub fn simulate_disconnect(&self, reason: &str) -> bool {
        let _emit = self.shared.emit_guard.lock();

        let cycle = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Connected {
                return false;
            }
            inner.teardown();
            let attempt = inner.backoff.attempt();
            inner.state = ConnectionState::Reconnecting { attempt };
            inner.cycle
        };

        tracing::warn!(reason, "Connection lost");
        self.emit(&ConnectionEvent::Close(CloseInfo::abnormal(reason)));
        self.schedule_reconnect(cycle);
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> Option<String> {
        self.shared.inner.lock().endpoint.clone()
    }

    /// Consecutive failed cycles since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.shared.inner.lock().backoff.attempt()
    }

    fn start_cycle(&self, cycle: u64, delay: Duration) {
        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(run_cycle(weak, cycle, delay));

        let mut inner = self.shared.inner.lock();
        if inner.cycle == cycle {
            inner.task = Some(task);
        } else {
            // Superseded between unlock and spawn
            task.abort();
        }
    }

    fn is_current(&self, cycle: u64) -> bool {
        self.shared.inner.lock().cycle == cycle
    }

    fn handle_open(&self, cycle: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let _emit = self.shared.emit_guard.lock();
        {
            let mut inner = self.shared.inner.lock();
            if inner.cycle != cycle {
                return false;
            }
            inner.state = ConnectionState::Connected;
            inner.backoff.reset();
            inner.outbound = Some(outbound);
        }

        tracing::info!(endpoint = ?self.endpoint(), "Connection open");
        self.emit(&ConnectionEvent::Open);
        true
    }

    fn handle_message(&self, cycle: u64, text: String) -> bool {
        let _emit = self.shared.emit_guard.lock();
        if !self.is_current(cycle) {
            return false;
        }
        self.emit(&ConnectionEvent::Message(text));
        true
    }

    fn handle_close(&self, cycle: u64, info: CloseInfo) {
        let _emit = self.shared.emit_guard.lock();
        {
            let mut inner = self.shared.inner.lock();
            if inner.cycle != cycle {
                return;
            }
            inner.outbound = None;
            if info.is_normal() {
                inner.state = ConnectionState::Disconnected;
                inner.task = None;
            } else {
                let attempt = inner.backoff.attempt();
                inner.state = ConnectionState::Reconnecting { attempt };
            }
        }

        if info.is_normal() {
            tracing::info!(code = info.code, reason = %info.reason, "Peer closed connection");
            self.emit(&ConnectionEvent::Close(info));
        } else {
            tracing::warn!(code = info.code, reason = %info.reason, "Connection lost");
            self.emit(&ConnectionEvent::Close(info));
            self.schedule_reconnect(cycle);
        }
    }

    fn handle_open_failed(&self, cycle: u64, error: &str) {
        if !self.is_current(cycle) {
            return;
        }
        tracing::warn!(error, "Connection attempt failed");
        self.schedule_reconnect(cycle);
    }

    fn schedule_reconnect(&self, cycle: u64) {
        let next = {
            let mut inner = self.shared.inner.lock();
            if inner.cycle != cycle {
                return;
            }
            match inner.backoff.next_delay() {
                Some(delay) => {
                    inner.cycle += 1;
                    inner.outbound = None;
                    let attempt = inner.backoff.attempt();
                    inner.state = ConnectionState::Reconnecting { attempt };
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );
                    Some((inner.cycle, delay))
                }
                None => {
                    inner.state = ConnectionState::Failed;
                    inner.outbound = None;
                    inner.task = None;
                    tracing::error!(
                        attempts = inner.backoff.attempt(),
                        "Reconnection attempts exhausted, manual reconnect required"
                    );
                    None
                }
            }
        };

        if let Some((cycle, delay)) = next {
            self.start_cycle(cycle, delay);
        }
    }

    /// Invoke every callback registered for the event's kind, in registration
    /// order. A panicking callback is logged and does not stop the others.
    fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let callbacks: Vec<EventCallback> = {
            let inner = self.shared.inner.lock();
            inner
                .listeners
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, cb)| cb.clone())
                .collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(event = ?kind, "Connection listener panicked");
            }
        }
    }
}

/// One connection cycle: optional backoff delay, open, then pump frames until
/// the link ends or the cycle is superseded.
async fn run_cycle(weak: Weak<Shared>, cycle: u64, delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let (connector, endpoint) = {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let inner = shared.inner.lock();
        if inner.cycle != cycle {
            return;
        }
        let Some(endpoint) = inner.endpoint.clone() else {
            return;
        };
        (shared.connector.clone(), endpoint)
    };

    let result = connector.open(&endpoint).await;

    let mut inbound = {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let manager = ConnectionManager { shared };
        match result {
            Err(e) => {
                manager.handle_open_failed(cycle, &e.to_string());
                return;
            }
            Ok(Link { outbound, inbound }) => {
                if !manager.handle_open(cycle, outbound) {
                    return;
                }
                inbound
            }
        }
    };

    loop {
        let frame = inbound.recv().await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let manager = ConnectionManager { shared };

        match frame {
            Some(Frame::Text(text)) => {
                if !manager.handle_message(cycle, text) {
                    return;
                }
            }
            Some(Frame::Closed(info)) => {
                manager.handle_close(cycle, info);
                return;
            }
            None => {
                manager.handle_close(cycle, CloseInfo::abnormal("link dropped"));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn manager_with(connector: &MockConnector) -> ConnectionManager {
        ConnectionManager::new(Arc::new(connector.clone()), ReconnectPolicy::default())
    }

    fn record(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Open, EventKind::Close, EventKind::Message] {
            let events = events.clone();
            manager.on(kind, move |e| events.lock().push(e.clone()));
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fires_open() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let events = record(&manager);

        manager.connect("mock://a");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(events.lock().as_slice(), &[ConnectionEvent::Open]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_same_endpoint_is_noop() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);

        manager.connect("mock://a");
        settle().await;
        manager.connect("mock://a");
        settle().await;

        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_other_endpoint_replaces() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let events = record(&manager);

        manager.connect("mock://a");
        settle().await;
        manager.connect("mock://b");
        settle().await;

        assert_eq!(connector.opened(), 2);
        assert_eq!(
            events.lock().as_slice(),
            &[
                ConnectionEvent::Open,
                ConnectionEvent::Close(CloseInfo::normal()),
                ConnectionEvent::Open,
            ]
        );
        assert_eq!(manager.endpoint().as_deref(), Some("mock://b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_dropped() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);

        manager.send("hello");
        settle().await;
        assert!(connector.sent().is_empty());

        manager.connect("mock://a");
        settle().await;
        manager.send("hello");
        settle().await;
        assert_eq!(connector.sent(), vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_normal_and_does_not_reconnect() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let events = record(&manager);

        manager.connect("mock://a");
        settle().await;
        manager.close();

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.open_attempts(), 1);
        assert_eq!(
            events.lock().last(),
            Some(&ConnectionEvent::Close(CloseInfo::normal()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_in_registration_order() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            manager.on(EventKind::Message, move |_| order.lock().push(i));
        }

        manager.connect("mock://a");
        settle().await;
        connector.push_raw("ping");
        settle().await;

        assert_eq!(order.lock().as_slice(), &[0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_fires_twice() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let hits = Arc::new(Mutex::new(0));

        let callback = {
            let hits = hits.clone();
            move |_: &ConnectionEvent| *hits.lock() += 1
        };
        manager.on(EventKind::Open, callback.clone());
        manager.on(EventKind::Open, callback);

        manager.connect("mock://a");
        settle().await;
        assert_eq!(*hits.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_removes_listener() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let hits = Arc::new(Mutex::new(0));

        let id = {
            let hits = hits.clone();
            manager.on(EventKind::Open, move |_| *hits.lock() += 1)
        };
        assert!(manager.off(id));
        assert!(!manager.off(id));

        manager.connect("mock://a");
        settle().await;
        assert_eq!(*hits.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_block_others() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let reached = Arc::new(Mutex::new(false));

        manager.on(EventKind::Open, |_| panic!("listener bug"));
        {
            let reached = reached.clone();
            manager.on(EventKind::Open, move |_| *reached.lock() = true);
        }

        manager.connect("mock://a");
        settle().await;
        assert!(*reached.lock());
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_normal_close_does_not_reconnect() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);

        manager.connect("mock://a");
        settle().await;
        connector.close_normally();
        settle().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.open_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_message_after_close() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        let events = record(&manager);

        manager.connect("mock://a");
        settle().await;
        connector.push_raw("late");
        manager.close();
        settle().await;

        assert_eq!(
            events.lock().as_slice(),
            &[
                ConnectionEvent::Open,
                ConnectionEvent::Close(CloseInfo::normal())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_without_endpoint() {
        let connector = MockConnector::new();
        let manager = manager_with(&connector);
        assert!(!manager.reconnect());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
