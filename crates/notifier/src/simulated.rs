//! Live transport over a [`ConnectionManager`].
//!
//! After every `open` the transport subscribes to `user:{id}`; incoming
//! `notification` envelopes for that channel are dispatched through the hub.
//! While simulation is enabled it also emits demo notifications at a random
//! interval and occasionally forces a disconnect to exercise reconnection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use beacon_common::config::{ReconnectPolicy, SimulationConfig};
use beacon_common::types::{Envelope, Notification, user_channel};
use beacon_connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, EventKind,
    WeakConnectionManager,
};

use crate::demo::demo_notification;
use crate::hub::NotificationHub;
use crate::transport::NotificationTransport;

#[derive(Default)]
struct Binding {
    user_id: Option<String>,
    timers: Vec<JoinHandle<()>>,
}

impl Binding {
    fn stop_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

pub struct SimulatedTransport {
    hub: NotificationHub,
    manager: ConnectionManager,
    endpoint: String,
    simulation: SimulationConfig,
    binding: Arc<Mutex<Binding>>,
}

impl SimulatedTransport {
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: impl Into<String>,
        reconnect: ReconnectPolicy,
        simulation: SimulationConfig,
    ) -> Self {
        let manager = ConnectionManager::new(connector, reconnect);
        let hub = NotificationHub::new();
        let binding = Arc::new(Mutex::new(Binding::default()));

        {
            let hub = hub.clone();
            let binding = binding.clone();
            let weak = manager.downgrade();
            manager.on(EventKind::Open, move |_| {
                hub.set_status(true);
                subscribe_current(&weak, &binding);
            });
        }
        {
            let hub = hub.clone();
            manager.on(EventKind::Close, move |_| {
                hub.set_status(false);
            });
        }
        {
            let hub = hub.clone();
            let binding = binding.clone();
            manager.on(EventKind::Message, move |event| {
                if let ConnectionEvent::Message(text) = event {
                    handle_message(&hub, &binding, text);
                }
            });
        }

        Self {
            hub,
            manager,
            endpoint: endpoint.into(),
            simulation,
            binding,
        }
    }

    /// The underlying connection, for status inspection and fault injection.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn user_id(&self) -> Option<String> {
        self.binding.lock().user_id.clone()
    }

    fn start_timers(&self, user_id: &str) -> Vec<JoinHandle<()>> {
        vec![
            spawn_demo_loop(self.hub.clone(), user_id.to_string(), self.simulation.clone()),
            spawn_chaos_loop(self.manager.downgrade(), self.simulation.clone()),
        ]
    }
}

fn subscribe_current(weak: &WeakConnectionManager, binding: &Mutex<Binding>) {
    let Some(user_id) = binding.lock().user_id.clone() else {
        return;
    };
    let Some(manager) = weak.upgrade() else {
        return;
    };

    let subscribe = Envelope::Subscribe {
        channel: user_channel(&user_id),
    };
    match subscribe.to_json() {
        Ok(json) => {
            tracing::debug!(user_id = %user_id, "Subscribing");
            manager.send(json);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode subscribe envelope"),
    }
}

fn handle_message(hub: &NotificationHub, binding: &Mutex<Binding>, text: &str) {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed envelope");
            return;
        }
    };

    match envelope {
        Envelope::Notification {
            channel,
            notification,
        } => {
            let expected = binding.lock().user_id.as_deref().map(user_channel);
            if let (Some(channel), Some(expected)) = (&channel, &expected)
                && channel != expected
            {
                tracing::debug!(channel = %channel, "Ignoring notification for another channel");
                return;
            }
            hub.dispatch(&notification);
        }
        Envelope::SubscriptionSuccess { channel, .. } => {
            tracing::info!(channel = ?channel, "Subscription confirmed");
        }
        Envelope::Subscribe { channel } => {
            tracing::debug!(channel = %channel, "Ignoring client-bound subscribe");
        }
    }
}

fn spawn_demo_loop(hub: NotificationHub, user_id: String, config: SimulationConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            return;
        }
        let min = config.demo_min_interval.as_millis() as u64;
        let max = (config.demo_max_interval.as_millis() as u64).max(min);

        loop {
            let delay = rand::thread_rng().gen_range(min..=max);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if hub.is_connected() {
                hub.dispatch(&demo_notification(Some(&user_id)));
            } else {
                tracing::debug!("Offline, skipping demo notification");
            }
        }
    })
}

/// Clamp into `0.0..=1.0`; non-finite values disable chaos.
fn chaos_probability(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        tracing::warn!(probability = raw, "Non-finite chaos drop probability, chaos disabled");
        0.0
    }
}

fn spawn_chaos_loop(manager: WeakConnectionManager, config: SimulationConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled || config.chaos_tick.is_zero() {
            return;
        }
        let probability = chaos_probability(config.chaos_drop_probability);
        let start = tokio::time::Instant::now() + config.chaos_tick;
        let mut ticker = tokio::time::interval_at(start, config.chaos_tick);

        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if rand::thread_rng().gen_bool(probability) {
                manager.simulate_disconnect("simulated network interruption");
            }
        }
    })
}

#[async_trait]
impl NotificationTransport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    async fn connect(&self, user_id: &str) {
        let previous = self.binding.lock().user_id.clone();
        if previous.as_deref() == Some(user_id) {
            match self.manager.state() {
                ConnectionState::Failed | ConnectionState::Disconnected => {
                    self.reconnect().await;
                }
                state => tracing::debug!(user_id, state = ?state, "Already bound"),
            }
            return;
        }
        if previous.is_some() {
            self.disconnect().await;
        }

        tracing::info!(user_id, endpoint = %self.endpoint, "Binding simulated transport");
        let timers = if self.simulation.enabled {
            self.start_timers(user_id)
        } else {
            Vec::new()
        };
        {
            let mut binding = self.binding.lock();
            binding.user_id = Some(user_id.to_string());
            binding.timers = timers;
        }
        self.manager.connect(&self.endpoint);
    }

    async fn disconnect(&self) {
        let user_id = {
            let mut binding = self.binding.lock();
            binding.stop_timers();
            binding.user_id.take()
        };
        self.manager.close();
        self.hub.set_status(false);
        if let Some(user_id) = user_id {
            tracing::info!(user_id = %user_id, "Simulated transport unbound");
        }
    }

    async fn reconnect(&self) -> bool {
        let Some(user_id) = self.binding.lock().user_id.clone() else {
            tracing::warn!("Reconnect requested while unbound");
            return false;
        };
        tracing::info!(user_id = %user_id, state = ?self.manager.state(), "Reconnecting simulated transport");
        self.manager.reconnect()
    }

    async fn trigger_demo_notification(&self) -> Notification {
        let user_id = self.binding.lock().user_id.clone();
        let notification = demo_notification(user_id.as_deref());
        self.hub.dispatch(&notification);
        notification
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.binding.lock().stop_timers();
    }
}
