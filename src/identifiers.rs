//! Type-safe identifiers.
//!
//! Every transport handle the controller creates gets a fresh [`SessionId`].
//! Transport events carry the id of the handle that produced them, which lets
//! the controller discard anything emitted by a handle it already tore down.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// SessionId
// ============================================================================

/// Process-wide counter backing [`SessionId::next`].
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identifier of a single transport handle.
///
/// Ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    /// Allocates the next unused id.
    #[must_use]
    pub fn next() -> Self {
        let raw = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        // Counter starts at 1 and would need 2^64 sessions to wrap.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Wraps a raw value; returns `None` for zero.
    #[inline]
    #[must_use]
    pub fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
