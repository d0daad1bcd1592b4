//! In-process pub/sub keyed by logical channel (`user:{id}`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use beacon_common::types::Notification;

/// Per-channel buffer; slower subscribers observe `Lagged`.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Default)]
pub struct ChannelHub {
    senders: Arc<Mutex<HashMap<String, broadcast::Sender<Notification>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        let mut senders = self.senders.lock();
        senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to every live subscriber of `channel`. Returns how many
    /// received it; zero when nobody is listening.
    pub fn publish(&self, channel: &str, notification: Notification) -> usize {
        let mut senders = self.senders.lock();
        let Some(sender) = senders.get(channel) else {
            return 0;
        };
        match sender.send(notification) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Every receiver is gone
                senders.remove(channel);
                0
            }
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.senders
            .lock()
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Channels with at least one live subscriber.
    pub fn active_channels(&self) -> usize {
        let mut senders = self.senders.lock();
        senders.retain(|_, sender| sender.receiver_count() > 0);
        senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_only_that_channel() {
        let hub = ChannelHub::new();
        let mut alice = hub.subscribe("user:alice");
        let mut bob = hub.subscribe("user:bob");

        let n = Notification::new("t", "m");
        assert_eq!(hub.publish("user:alice", n.clone()), 1);

        assert_eq!(alice.recv().await.unwrap().id, n.id);
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = ChannelHub::new();
        assert_eq!(hub.publish("user:nobody", Notification::new("t", "m")), 0);

        let rx = hub.subscribe("user:gone");
        drop(rx);
        assert_eq!(hub.publish("user:gone", Notification::new("t", "m")), 0);
        assert_eq!(hub.active_channels(), 0);
    }
}
