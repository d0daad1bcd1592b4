//! Notification service: listener hub, interchangeable transports and the
//! consumer-facing inbox.

pub mod center;
pub mod demo;
pub mod hub;
pub mod list;
pub mod panel;
pub mod persistent;
pub mod simulated;
pub mod store;
pub mod transport;

pub use center::{InboxSnapshot, NotificationCenter};
pub use hub::{NotificationHub, Subscription};
pub use list::NotificationList;
pub use panel::{InboxPanel, InboxView};
pub use persistent::PersistentTransport;
pub use simulated::SimulatedTransport;
pub use store::{MemoryNotificationStore, NotificationStore, PgNotificationStore};
pub use transport::NotificationTransport;
