//! Reconnection backoff.
//!
//! [`decide`] is a pure function from the current [`RetryState`] and the
//! controller's [`RetryPolicy`] to a [`RetryDecision`]. [`RetryScheduler`]
//! wraps the two and is the only thing that mutates the attempt counter.
//!
//! # Backoff
//!
//! `delay = base_delay * 2^attempt`, optionally clamped to `max_delay`.
//! Without a cap the delay keeps doubling until it saturates.
//!
//! Clean closes never reach the scheduler; the controller handles them.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::time::Instant;

// ============================================================================
// Constants
// ============================================================================

/// Default number of reconnection attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay for the exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Stand-in for "never" when a deadline does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ============================================================================
// RetryPolicy
// ============================================================================

/// Immutable retry configuration for one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnection attempts before the terminal error state.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Optional ceiling for a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    /// Creates an uncapped policy.
    #[inline]
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: None,
        }
    }

    /// Sets the ceiling for a single delay.
    #[inline]
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Returns the delay scheduled for the given zero-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

// ============================================================================
// RetryState / RetryDecision
// ============================================================================

/// Mutable attempt counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    /// Returns the number of retries scheduled since the last successful open.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What to do after an abnormal close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reopen after `delay`. `attempt` is the counter after this retry.
    Retry {
        /// Wait before reopening.
        delay: Duration,
        /// Attempt number of this retry (1-based).
        attempt: u32,
    },
    /// Budget exhausted.
    GiveUp,
}

/// Decides the next step without mutating anything.
#[must_use]
pub fn decide(state: &RetryState, policy: &RetryPolicy) -> RetryDecision {
    if state.attempt >= policy.max_retries {
        return RetryDecision::GiveUp;
    }

    RetryDecision::Retry {
        delay: policy.delay_for(state.attempt),
        attempt: state.attempt + 1,
    }
}

// ============================================================================
// RetryScheduler
// ============================================================================

/// Owns the attempt counter for one controller.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetryScheduler {
    /// Creates a scheduler with a fresh counter.
    #[inline]
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::default(),
        }
    }

    /// Returns the policy.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the current attempt counter.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.state.attempt
    }

    /// Handles an abnormal close, advancing the counter when a retry is scheduled.
    pub fn on_abnormal_close(&mut self) -> RetryDecision {
        let decision = decide(&self.state, &self.policy);
        if let RetryDecision::Retry { attempt, .. } = decision {
            self.state.attempt = attempt;
        }
        decision
    }

    /// Resets the counter after a successful open or an explicit restart.
    #[inline]
    pub fn reset(&mut self) {
        self.state = RetryState::default();
    }
}

// ============================================================================
// Deadlines
// ============================================================================

/// `now + delay`, clamped to a far-future instant instead of overflowing.
#[must_use]
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ============================================================================
// Tests
// ============================================================================
