use async_trait::async_trait;

use beacon_common::types::Notification;

use crate::hub::{NotificationHub, NotificationListener, StatusListener, Subscription};

/// Capability set shared by every live transport.
///
/// Store operations default to no-ops so a purely live transport only has to
/// provide `connect`, `disconnect` and `trigger_demo_notification`. None of
/// the operations return errors: transport failures go to the reconnection
/// loop and persistence failures are logged.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn hub(&self) -> &NotificationHub;

    /// Bind to the channel of `user_id`. A different previous binding is torn
    /// down first. Calling it again for the bound user restarts delivery if
    /// automatic recovery has given up.
    async fn connect(&self, user_id: &str);

    async fn disconnect(&self);

    /// Restart live delivery for the bound user with a fresh retry schedule.
    /// This is the only way back once automatic recovery has given up.
    /// Returns false when nothing is bound.
    async fn reconnect(&self) -> bool;

    fn on_notification(&self, listener: NotificationListener) -> Subscription {
        self.hub().subscribe_notifications(listener)
    }

    fn on_connection_status(&self, listener: StatusListener) -> Subscription {
        self.hub().subscribe_status(listener)
    }

    fn is_connected(&self) -> bool {
        self.hub().is_connected()
    }

    /// Synthesize a notification and dispatch it now, whatever the
    /// connection state.
    async fn trigger_demo_notification(&self) -> Notification;

    async fn add_notification(&self, notification: Notification) {
        self.hub().dispatch(&notification);
    }

    async fn mark_as_read(&self, _id: &str) {}

    async fn mark_all_as_read(&self) {}

    async fn clear_notification(&self, _id: &str) {}

    async fn clear_all_notifications(&self) {}

    /// Newest stored notifications for the bound user.
    async fn history(&self, _limit: i64) -> Vec<Notification> {
        Vec::new()
    }
}
