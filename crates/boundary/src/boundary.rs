//! Supervisor around a [`Component`].
//!
//! State machine: `Stable → Faulted → Retrying → Stable | Faulted`, with
//! `ManualResetRequired` once an interference episode exhausts
//! `max_auto_retries`. Generic faults wait in `Faulted` for [`ResilienceBoundary::reset`].
//!
//! The boundary owns its retry timer. `reset`, `unmount` and drop all cancel it.
//!
//! Components render with the boundary's lock released, so a component may
//! query or reset its own boundary. A pass that overlaps a reset or unmount
//! is discarded. Caught panics still reach the process panic hook.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use beacon_common::config::RestartPolicy;
use beacon_common::error::RenderError;

use crate::classify::{Classifier, FaultKind, default_classifier};
use crate::component::{Component, Render};

/// Neutral text shown in place of a faulted subtree.
pub const FALLBACK_MESSAGE: &str = "Notifications are temporarily unavailable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BoundaryState {
    Stable,
    Faulted { kind: FaultKind, retry_count: u32 },
    Retrying,
    ManualResetRequired,
}

/// What the boundary renders in place of its subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryView<V> {
    /// Neutral placeholder while the subtree is loading (or unmounted).
    Loading,
    Content(V),
    /// Neutral fallback. A manual retry is always offered.
    Fallback {
        message: String,
        kind: FaultKind,
        auto_retry_pending: bool,
    },
}

type Factory<C> = Box<dyn FnMut() -> C + Send>;

struct Inner<C: Component> {
    factory: Factory<C>,
    component: Option<C>,
    classifier: Classifier,
    policy: RestartPolicy,
    state: BoundaryState,
    retry_count: u32,
    last_kind: FaultKind,
    timer: Option<JoinHandle<()>>,
    epoch: u64,
}

impl<C: Component> Inner<C> {
    fn cancel_timer(&mut self) {
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn fallback(&self) -> BoundaryView<C::View> {
        BoundaryView::Fallback {
            message: FALLBACK_MESSAGE.to_string(),
            kind: self.last_kind,
            auto_retry_pending: self.timer.is_some(),
        }
    }
}

/// Fault-isolating wrapper. Mounts the component from `factory` and
/// re-mounts it from scratch on every retry or reset.
pub struct ResilienceBoundary<C: Component> {
    shared: Arc<Mutex<Inner<C>>>,
}

impl<C: Component> ResilienceBoundary<C> {
    pub fn new<F>(mut factory: F, policy: RestartPolicy) -> Self
    where
        F: FnMut() -> C + Send + 'static,
    {
        let component = factory();
        Self {
            shared: Arc::new(Mutex::new(Inner {
                factory: Box::new(factory),
                component: Some(component),
                classifier: default_classifier(),
                policy,
                state: BoundaryState::Stable,
                retry_count: 0,
                last_kind: FaultKind::Generic,
                timer: None,
                epoch: 0,
            })),
        }
    }

    /// Replace the fault classifier.
    pub fn with_classifier(self, classifier: Classifier) -> Self {
        self.shared.lock().classifier = classifier;
        self
    }

    /// Render the subtree, or the placeholder/fallback in its place.
    /// Never panics on behalf of the component.
    pub fn render(&self) -> BoundaryView<C::View> {
        let (component, epoch) = {
            let mut inner = self.shared.lock();
            if let BoundaryState::Faulted { .. } | BoundaryState::ManualResetRequired = inner.state {
                return inner.fallback();
            }
            let Some(component) = inner.component.take() else {
                return BoundaryView::Loading;
            };
            (component, inner.epoch)
        };
        Self::render_pass(&self.shared, component, epoch)
    }

    /// Manual reset: clear the fault episode, cancel any pending retry and
    /// mount a fresh component.
    pub fn reset(&self) {
        let mut inner = self.shared.lock();
        inner.cancel_timer();
        inner.retry_count = 0;
        inner.state = BoundaryState::Stable;
        let component = (inner.factory)();
        inner.component = Some(component);
        tracing::info!("Boundary reset");
    }

    /// Dispose of the subtree. No retry fires afterwards.
    pub fn unmount(&self) {
        let mut inner = self.shared.lock();
        inner.cancel_timer();
        inner.component = None;
    }

    pub fn state(&self) -> BoundaryState {
        self.shared.lock().state
    }

    /// Automatic retries spent in the current fault episode.
    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retry_count
    }

    pub fn pending_retry(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.lock().component.is_some()
    }

    /// Render `component` outside the lock, then put it back and record the
    /// outcome unless the boundary was reset or unmounted meanwhile.
    fn render_pass(
        shared: &Arc<Mutex<Inner<C>>>,
        mut component: C,
        epoch: u64,
    ) -> BoundaryView<C::View> {
        let result = match catch_unwind(AssertUnwindSafe(|| component.render())) {
            Ok(result) => result,
            Err(payload) => Err(panic_to_error(payload)),
        };

        let mut inner = shared.lock();
        if inner.epoch != epoch {
            tracing::debug!("Discarding render pass overtaken by reset or unmount");
            return match inner.state {
                BoundaryState::Faulted { .. } | BoundaryState::ManualResetRequired => {
                    inner.fallback()
                }
                BoundaryState::Stable | BoundaryState::Retrying => BoundaryView::Loading,
            };
        }
        inner.component = Some(component);

        match result {
            Ok(render) => {
                if inner.state != BoundaryState::Stable {
                    tracing::info!(retries = inner.retry_count, "Boundary recovered");
                }
                inner.state = BoundaryState::Stable;
                inner.retry_count = 0;
                match render {
                    Render::Loading => BoundaryView::Loading,
                    Render::Ready(view) => BoundaryView::Content(view),
                }
            }
            Err(error) => Self::fault(shared, &mut inner, error),
        }
    }

    fn fault(
        shared: &Arc<Mutex<Inner<C>>>,
        inner: &mut Inner<C>,
        error: RenderError,
    ) -> BoundaryView<C::View> {
        let kind = (inner.classifier)(&error);
        inner.last_kind = kind;
        let retry_count = inner.retry_count;

        match kind {
            FaultKind::Generic => {
                tracing::warn!(error = %error, "Render fault, manual reset required");
                inner.state = BoundaryState::Faulted { kind, retry_count };
            }
            FaultKind::EnvironmentInterference if retry_count >= inner.policy.max_auto_retries => {
                tracing::error!(
                    error = %error,
                    retries = retry_count,
                    "Interference persisted through automatic retries, manual reset required"
                );
                inner.state = BoundaryState::ManualResetRequired;
            }
            FaultKind::EnvironmentInterference => {
                let delay = retry_delay(&inner.policy, retry_count);
                tracing::warn!(
                    error = %error,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Environment interference, scheduling retry"
                );
                inner.state = BoundaryState::Faulted { kind, retry_count };
                Self::schedule_retry(shared, inner, delay);
            }
        }

        inner.fallback()
    }

    fn schedule_retry(shared: &Arc<Mutex<Inner<C>>>, inner: &mut Inner<C>, delay: Duration) {
        inner.cancel_timer();
        let epoch = inner.epoch;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, retry left to manual reset");
            return;
        };

        let weak = Arc::downgrade(shared);
        inner.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(shared) = weak.upgrade() else {
                return;
            };
            Self::retry(&shared, epoch);
        }));
    }

    /// Remount from the factory and render once. Skipped if the timer was
    /// cancelled or the subtree unmounted after it fired.
    fn retry(shared: &Arc<Mutex<Inner<C>>>, epoch: u64) {
        let (component, epoch) = {
            let mut inner = shared.lock();
            if inner.epoch != epoch || inner.component.is_none() {
                return;
            }
            inner.timer = None;
            inner.state = BoundaryState::Retrying;
            inner.retry_count += 1;
            tracing::info!(attempt = inner.retry_count, "Remounting faulted subtree");

            inner.component = None;
            inner.epoch += 1;
            ((inner.factory)(), inner.epoch)
        };
        let _ = Self::render_pass(shared, component, epoch);
    }
}

impl<C: Component> Drop for ResilienceBoundary<C> {
    fn drop(&mut self) {
        self.shared.lock().cancel_timer();
    }
}

/// `base_delay_ms * 2^retry_count`.
fn retry_delay(policy: &RestartPolicy, retry_count: u32) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    Duration::from_millis(policy.base_delay_ms.saturating_mul(factor))
}

fn panic_to_error(payload: Box<dyn Any + Send>) -> RenderError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "component panicked".to_string()
    };
    RenderError::new(message)
}
