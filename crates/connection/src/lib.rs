//! Resilient duplex connection with exponential-backoff reconnection.

pub mod backoff;
pub mod connector;
pub mod manager;
pub mod mock;

pub use backoff::Backoff;
pub use connector::{CloseInfo, Connector, Frame, Link, WsConnector};
pub use manager::{
    ConnectionEvent, ConnectionManager, ConnectionState, EventKind, ListenerId,
    WeakConnectionManager,
};
pub use mock::MockConnector;
