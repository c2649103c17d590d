//! Foreground/background awareness.
//!
//! A [`VisibilityCoordinator`] tracks whether the hosting surface (page,
//! window, app) is in the foreground. It owns at most one system-level
//! listener, a [`VisibilitySource`], which is attached when the first
//! [`VisibilitySubscription`] is created and detached when the last one drops.
//!
//! Controllers subscribe; they never own the listener.
//!
//! # Example
//!
//! ```ignore
//! use livewire::visibility::VisibilityCoordinator;
//!
//! let coordinator = VisibilityCoordinator::global();
//! let mut subscription = coordinator.subscribe();
//!
//! // Host integration reports changes
//! coordinator.set_visible(false);
//! assert!(!subscription.changed().await);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

// ============================================================================
// VisibilitySource
// ============================================================================

/// The system-level visibility listener.
///
/// Implementations hook into whatever the host offers (window focus, app
/// lifecycle) and push changes through the [`VisibilityReporter`].
pub trait VisibilitySource: Send + Sync + 'static {
    /// Starts listening. Called when the first subscriber appears.
    fn attach(&self, reporter: VisibilityReporter);

    /// Stops listening. Called when the last subscriber leaves.
    fn detach(&self);
}

/// Handle a [`VisibilitySource`] uses to report changes.
///
/// Holds a weak reference, so a source that outlives its coordinator just
/// reports into the void.
#[derive(Clone)]
pub struct VisibilityReporter {
    inner: Weak<CoordinatorInner>,
}

impl VisibilityReporter {
    /// Reports the current foreground state.
    pub fn report(&self, visible: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.update(visible);
        }
    }
}

impl fmt::Debug for VisibilityReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityReporter").finish_non_exhaustive()
    }
}

// ============================================================================
// VisibilityCoordinator
// ============================================================================

/// Shared state behind a coordinator.
struct CoordinatorInner {
    /// Current visibility; starts `true`.
    state: watch::Sender<bool>,
    /// Live subscription count.
    subscribers: Mutex<usize>,
    /// Installed listener, if any.
    source: Mutex<Option<Arc<dyn VisibilitySource>>>,
}

impl CoordinatorInner {
    fn update(&self, visible: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == visible {
                return false;
            }
            *current = visible;
            true
        });

        if changed {
            debug!(visible, "Visibility changed");
        }
    }
}

/// Process-wide foreground tracker with reference-counted listener lifetime.
#[derive(Clone)]
pub struct VisibilityCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for VisibilityCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VisibilityCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityCoordinator")
            .field("visible", &self.is_visible())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl VisibilityCoordinator {
    /// Creates a standalone coordinator with no listener; starts visible.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            inner: Arc::new(CoordinatorInner {
                state,
                subscribers: Mutex::new(0),
                source: Mutex::new(None),
            }),
        }
    }

    /// Creates a coordinator driven by `source`.
    #[must_use]
    pub fn with_source(source: impl VisibilitySource) -> Self {
        let coordinator = Self::new();
        coordinator.install_source(source);
        coordinator
    }

    /// Returns the process-wide coordinator used by default.
    #[must_use]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<VisibilityCoordinator> = OnceLock::new();
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Installs (or replaces) the system-level listener.
    ///
    /// If subscribers already exist the new source is attached immediately.
    pub fn install_source(&self, source: impl VisibilitySource) {
        let source: Arc<dyn VisibilitySource> = Arc::new(source);
        let subscribers = self.inner.subscribers.lock();
        let previous = self.inner.source.lock().replace(Arc::clone(&source));

        if *subscribers > 0 {
            if let Some(previous) = previous {
                previous.detach();
            }
            source.attach(self.reporter());
        }
    }

    /// Returns `true` when the host is foregrounded.
    #[inline]
    #[must_use]
    pub fn is_visible(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Reports a change from the host directly, without a source.
    #[inline]
    pub fn set_visible(&self, visible: bool) {
        self.inner.update(visible);
    }

    /// Returns the number of live subscriptions.
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        *self.inner.subscribers.lock()
    }

    /// Registers a subscriber, attaching the source if this is the first one.
    #[must_use]
    pub fn subscribe(&self) -> VisibilitySubscription {
        let mut subscribers = self.inner.subscribers.lock();
        *subscribers += 1;

        if *subscribers == 1 {
            let source = self.inner.source.lock().clone();
            if let Some(source) = source {
                debug!("Attaching visibility listener");
                source.attach(self.reporter());
            }
        }

        VisibilitySubscription {
            inner: Arc::clone(&self.inner),
            receiver: self.inner.state.subscribe(),
        }
    }

    fn reporter(&self) -> VisibilityReporter {
        VisibilityReporter {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

// ============================================================================
// VisibilitySubscription
// ============================================================================

/// A registered observer. Dropping it unsubscribes.
pub struct VisibilitySubscription {
    inner: Arc<CoordinatorInner>,
    receiver: watch::Receiver<bool>,
}

impl fmt::Debug for VisibilitySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilitySubscription")
            .field("visible", &self.is_visible())
            .finish()
    }
}

impl VisibilitySubscription {
    /// Returns the current visibility.
    #[inline]
    #[must_use]
    pub fn is_visible(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Waits for the next change and returns the new value.
    pub async fn changed(&mut self) -> bool {
        if self.receiver.changed().await.is_err() {
            // The coordinator outlives every subscription; never resolves.
            std::future::pending::<()>().await;
        }
        *self.receiver.borrow_and_update()
    }

    /// Turns the subscription into a visibility-aware ticker.
    #[must_use]
    pub fn interval(self, period: Duration, enabled: bool) -> VisibilityAwareInterval {
        VisibilityAwareInterval {
            subscription: self,
            period,
            enabled,
        }
    }
}

impl Drop for VisibilitySubscription {
    fn drop(&mut self) {
        let mut subscribers = self.inner.subscribers.lock();
        *subscribers = subscribers.saturating_sub(1);

        if *subscribers == 0 {
            let source = self.inner.source.lock().clone();
            if let Some(source) = source {
                debug!("Detaching visibility listener");
                source.detach();
            }
        }
    }
}

// ============================================================================
// Visibility-Aware Interval
// ============================================================================

/// Returns `period` when visible and enabled, `None` ("paused") otherwise.
#[inline]
#[must_use]
pub fn visible_interval(period: Duration, enabled: bool, visible: bool) -> Option<Duration> {
    (enabled && visible).then_some(period)
}

/// Periodic ticker that stops scheduling entirely while hidden or disabled.
///
/// Intended for polling consumers that should not fire requests into a
/// backgrounded surface.
#[derive(Debug)]
pub struct VisibilityAwareInterval {
    subscription: VisibilitySubscription,
    period: Duration,
    enabled: bool,
}

impl VisibilityAwareInterval {
    /// Returns the effective period, or `None` while paused.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<Duration> {
        visible_interval(self.period, self.enabled, self.subscription.is_visible())
    }

    /// Enables or disables the ticker.
    #[inline]
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Waits for the next tick.
    ///
    /// Sleeps one period while active. A visibility change restarts the
    /// wait; while paused nothing is scheduled until the surface returns.
    pub async fn tick(&mut self) {
        loop {
            match self.current() {
                Some(period) => {
                    tokio::select! {
                        () = sleep(period) => return,
                        _ = self.subscription.changed() => {}
                    }
                }
                None => {
                    self.subscription.changed().await;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
