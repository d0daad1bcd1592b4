//! Shared application state for the Axum API server.

use std::sync::Arc;

use beacon_common::config::AppConfig;
use beacon_notifier::NotificationStore;

use crate::channels::ChannelHub;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
    pub channels: ChannelHub,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn NotificationStore>, config: AppConfig) -> Self {
        Self {
            store,
            channels: ChannelHub::new(),
            config,
        }
    }
}
