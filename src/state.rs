//! Observable connection state.
//!
//! [`ConnectionState`] is the five-way lifecycle enum; [`Status`] is the
//! snapshot the controller publishes on every transition.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a live connection.
///
/// Exactly one state holds at any instant. [`ConnectionState::Error`] is
/// terminal until the consumer calls `reconnect()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport, nothing scheduled.
    #[default]
    Disconnected,
    /// A transport handle is opening.
    Connecting,
    /// The transport is open and delivering frames.
    Connected,
    /// The last handle closed abnormally; a retry is pending.
    Reconnecting,
    /// Retries exhausted.
    Error,
}

impl ConnectionState {
    /// Returns the lowercase wire name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Returns `true` while a transport is open or being (re)established.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Returns `true` for the terminal error state.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Snapshot of everything a consumer can observe about a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Mirrors the scheduler's attempt counter.
    pub retry_count: u32,
    /// Human-readable diagnostic; set in `error` state or right after a
    /// transport error event.
    pub error: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
