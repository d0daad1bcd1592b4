//! Resilience boundary: fault isolation with bounded, backed-off restarts
//! for anything that renders live notification state.

pub mod boundary;
pub mod classify;
pub mod component;

pub use boundary::{BoundaryState, BoundaryView, ResilienceBoundary};
pub use classify::{Classifier, FaultKind, classify_by_signature};
pub use component::{Component, Render};
