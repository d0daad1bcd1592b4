//! Transport backed by a [`NotificationStore`] and its insert feed.
//!
//! Local writes are dispatched to listeners first and persisted afterwards;
//! a failed write is logged and never reaches the caller. The insert feed
//! only carries new rows. Updates and deletes made elsewhere are not
//! propagated to live listeners.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use beacon_common::config::ReconnectPolicy;
use beacon_common::types::Notification;
use beacon_connection::Backoff;

use crate::demo::demo_notification;
use crate::hub::NotificationHub;
use crate::store::NotificationStore;
use crate::transport::NotificationTransport;

/// How many locally dispatched ids are remembered for echo suppression.
const ECHO_MEMORY: usize = 256;

/// Bounded set of ids dispatched locally and not yet seen on the feed.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    fn remember(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > ECHO_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    /// True (and forgets the id) if it was dispatched locally.
    fn take(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            self.order.retain(|known| known != id);
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

#[derive(Default)]
struct Binding {
    user_id: Option<String>,
    feed: Option<JoinHandle<()>>,
    echoes: RecentIds,
}

pub struct PersistentTransport<S: NotificationStore> {
    hub: NotificationHub,
    store: Arc<S>,
    policy: ReconnectPolicy,
    binding: Arc<Mutex<Binding>>,
}

impl<S: NotificationStore> PersistentTransport<S> {
    pub fn new(store: Arc<S>, policy: ReconnectPolicy) -> Self {
        Self {
            hub: NotificationHub::new(),
            store,
            policy,
            binding: Arc::new(Mutex::new(Binding::default())),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn user_id(&self) -> Option<String> {
        self.binding.lock().user_id.clone()
    }

    fn spawn_feed(&self, user_id: &str) -> JoinHandle<()> {
        tokio::spawn(run_feed(
            self.store.clone(),
            self.hub.clone(),
            self.binding.clone(),
            user_id.to_string(),
            self.policy,
        ))
    }

    fn bound_user(&self, operation: &'static str) -> Option<String> {
        let user_id = self.binding.lock().user_id.clone();
        if user_id.is_none() {
            tracing::warn!(operation, "Not bound to a user, skipping store write");
        }
        user_id
    }
}

/// Follow the insert feed for `user_id`, resubscribing on the reconnection
/// schedule whenever it ends.
async fn run_feed<S: NotificationStore>(
    store: Arc<S>,
    hub: NotificationHub,
    binding: Arc<Mutex<Binding>>,
    user_id: String,
    policy: ReconnectPolicy,
) {
    let mut backoff = Backoff::new(policy);

    loop {
        match store.watch_inserts(&user_id).await {
            Ok(mut feed) => {
                backoff.reset();
                hub.set_status(true);
                tracing::info!(user_id = %user_id, "Insert feed subscribed");

                while let Some(notification) = feed.next().await {
                    if binding.lock().echoes.take(&notification.id) {
                        tracing::debug!(id = %notification.id, "Suppressing echo of local write");
                        continue;
                    }
                    hub.dispatch(&notification);
                }

                hub.set_status(false);
                tracing::warn!(user_id = %user_id, "Insert feed ended");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Insert feed subscription failed");
            }
        }

        match backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Resubscribing to insert feed"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                tracing::error!(user_id = %user_id, "Insert feed retries exhausted");
                return;
            }
        }
    }
}

#[async_trait]
impl<S: NotificationStore> NotificationTransport for PersistentTransport<S> {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    async fn connect(&self, user_id: &str) {
        let (previous, feed_stopped) = {
            let binding = self.binding.lock();
            let stopped = binding.feed.as_ref().is_none_or(|feed| feed.is_finished());
            (binding.user_id.clone(), stopped)
        };
        if previous.as_deref() == Some(user_id) {
            if feed_stopped {
                self.reconnect().await;
            } else {
                tracing::debug!(user_id, "Already bound");
            }
            return;
        }
        if previous.is_some() {
            self.disconnect().await;
        }

        tracing::info!(user_id, "Binding persistent transport");
        let feed = self.spawn_feed(user_id);

        let mut binding = self.binding.lock();
        binding.user_id = Some(user_id.to_string());
        binding.feed = Some(feed);
    }

    async fn disconnect(&self) {
        {
            let mut binding = self.binding.lock();
            if let Some(feed) = binding.feed.take() {
                feed.abort();
            }
            binding.user_id = None;
            binding.echoes.clear();
        }
        self.hub.set_status(false);
    }

    async fn reconnect(&self) -> bool {
        let mut binding = self.binding.lock();
        let Some(user_id) = binding.user_id.clone() else {
            tracing::warn!("Reconnect requested while unbound");
            return false;
        };
        if let Some(feed) = binding.feed.take() {
            feed.abort();
        }
        tracing::info!(user_id = %user_id, "Resubscribing insert feed on request");
        binding.feed = Some(self.spawn_feed(&user_id));
        true
    }

    async fn trigger_demo_notification(&self) -> Notification {
        let user_id = self.binding.lock().user_id.clone();
        let notification = demo_notification(user_id.as_deref());
        self.add_notification(notification.clone()).await;
        notification
    }

    async fn add_notification(&self, notification: Notification) {
        self.hub.dispatch(&notification);

        let Some(user_id) = self.bound_user("add_notification") else {
            return;
        };
        self.binding.lock().echoes.remember(&notification.id);

        if let Err(e) = self.store.insert(&user_id, &notification).await {
            tracing::warn!(id = %notification.id, error = %e, "Failed to persist notification");
        }
    }

    async fn mark_as_read(&self, id: &str) {
        let Some(user_id) = self.bound_user("mark_as_read") else {
            return;
        };
        if let Err(e) = self.store.mark_read(&user_id, id).await {
            tracing::warn!(id, error = %e, "Failed to persist read marker");
        }
    }

    async fn mark_all_as_read(&self) {
        let Some(user_id) = self.bound_user("mark_all_as_read") else {
            return;
        };
        if let Err(e) = self.store.mark_all_read(&user_id).await {
            tracing::warn!(error = %e, "Failed to persist read markers");
        }
    }

    async fn clear_notification(&self, id: &str) {
        let Some(user_id) = self.bound_user("clear_notification") else {
            return;
        };
        if let Err(e) = self.store.delete(&user_id, id).await {
            tracing::warn!(id, error = %e, "Failed to delete notification");
        }
    }

    async fn clear_all_notifications(&self) {
        let Some(user_id) = self.bound_user("clear_all_notifications") else {
            return;
        };
        if let Err(e) = self.store.delete_all(&user_id).await {
            tracing::warn!(error = %e, "Failed to delete notifications");
        }
    }

    async fn history(&self, limit: i64) -> Vec<Notification> {
        let Some(user_id) = self.binding.lock().user_id.clone() else {
            return Vec::new();
        };
        match self.store.recent(&user_id, limit).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load notification history");
                Vec::new()
            }
        }
    }
}

impl<S: NotificationStore> Drop for PersistentTransport<S> {
    fn drop(&mut self) {
        if let Some(feed) = self.binding.lock().feed.take() {
            feed.abort();
        }
    }
}
