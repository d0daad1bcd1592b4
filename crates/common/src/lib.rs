//! Shared model, wire envelope, error taxonomy and configuration for the
//! beacon live-notification workspace.

pub mod config;
pub mod db;
pub mod error;
pub mod types;
