//! Application-level ping/pong liveness watchdog.
//!
//! Detects connections that died silently (NAT timeouts, stale sockets) and
//! never produced an error or close event. The monitor is a pair of deadlines
//! owned by the controller's event loop; clearing a deadline cancels the timer.
//!
//! # Protocol
//!
//! 1. Every `interval` while connected, send `{"type":"ping"}`
//! 2. Arm a `pong_timeout` deadline right after sending
//! 3. `{"type":"pong"}` disarms the deadline
//! 4. An expired deadline forces the session closed and into the retry path

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::message::PING_FRAME;
use crate::retry::deadline_after;
use crate::transport::millis;

// ============================================================================
// Constants
// ============================================================================

/// Default interval between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default time allowed for a pong to arrive.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_millis(5_000);

// ============================================================================
// KeepAliveConfig
// ============================================================================

/// Keep-alive configuration.
///
/// Disabled by default; when enabled without further tuning the 30s/5s
/// defaults apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Whether pings are sent at all.
    pub enabled: bool,
    /// Time between pings.
    pub interval: Duration,
    /// Time allowed for the pong.
    pub pong_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

impl KeepAliveConfig {
    /// Creates an enabled config with default timings.
    #[inline]
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Sets the ping interval.
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the pong timeout.
    #[inline]
    #[must_use]
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }
}

// ============================================================================
// KeepAliveMonitor
// ============================================================================

/// Ping scheduler and pong watchdog for one connection.
#[derive(Debug, Clone)]
pub struct KeepAliveMonitor {
    config: KeepAliveConfig,
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
}

impl KeepAliveMonitor {
    /// Creates an idle monitor.
    #[must_use]
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            next_ping: None,
            pong_deadline: None,
        }
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Arms the first ping. No-op when disabled.
    pub fn start(&mut self, now: Instant) {
        self.pong_deadline = None;
        self.next_ping = self
            .config
            .enabled
            .then(|| deadline_after(now, self.config.interval));

        if self.config.enabled {
            debug!(interval_ms = millis(self.config.interval), "Keep-alive started");
        }
    }

    /// Cancels both timers.
    #[inline]
    pub fn stop(&mut self) {
        self.next_ping = None;
        self.pong_deadline = None;
    }

    /// Returns `true` while a ping is scheduled.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.next_ping.is_some()
    }

    /// When the next ping is due.
    #[inline]
    #[must_use]
    pub fn next_ping(&self) -> Option<Instant> {
        self.next_ping
    }

    /// When the outstanding pong expires.
    #[inline]
    #[must_use]
    pub fn pong_deadline(&self) -> Option<Instant> {
        self.pong_deadline
    }

    /// Sends a ping through `send` and arms the pong deadline.
    ///
    /// An already outstanding deadline is kept, so a slow pong cannot be
    /// postponed by later pings. Returns what `send` returned.
    pub fn ping(&mut self, now: Instant, send: impl FnOnce(&str) -> bool) -> bool {
        if !self.is_running() {
            return false;
        }

        let sent = send(PING_FRAME);
        trace!(sent, "Keep-alive ping");

        self.next_ping = Some(deadline_after(now, self.config.interval));
        self.pong_deadline
            .get_or_insert_with(|| deadline_after(now, self.config.pong_timeout));
        sent
    }

    /// Disarms the pong deadline. Returns `true` if one was pending.
    pub fn on_pong(&mut self) -> bool {
        let pending = self.pong_deadline.take().is_some();
        trace!(pending, "Keep-alive pong");
        pending
    }

    /// Returns `true` once the pong deadline has passed.
    #[inline]
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.pong_deadline.is_some_and(|deadline| now >= deadline)
    }
}

// ============================================================================
// Tests
// ============================================================================
