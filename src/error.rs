//! Error types for livewire.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! Fallible construction and configuration return [`Result<T>`] which uses [`Error`].
//! Runtime transport failures never surface as `Err` to the caller: the
//! controller recovers them locally and reports them through its status and
//! the `on_error` callback.
//!
//! ```ignore
//! use livewire::{ConnectionController, Result};
//!
//! fn example() -> Result<()> {
//!     let controller = ConnectionController::<serde_json::Value>::builder()
//!         .url("wss://example.com/live")
//!         .spawn()?;
//!     controller.send(r#"{"type":"subscribe"}"#);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidUrl`] |
//! | Session | [`Error::AlreadyOpen`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::KeepAliveTimeout`] |
//! | Terminal | [`Error::MaxRetriesExceeded`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |
//!
//! Malformed inbound frames are a separate [`ParseError`]; the controller logs
//! and drops them.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::SessionId;

// ============================================================================
// Constants
// ============================================================================

/// Message surfaced once the retry budget is exhausted.
pub const MAX_RETRIES_EXCEEDED: &str = "Max reconnection attempts exceeded";

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when connection options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Endpoint URL cannot be used with the selected transport.
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// `open` was called on a session that already owns a handle.
    #[error("Session {session} is already open")]
    AlreadyOpen {
        /// The session that rejected the call.
        session: SessionId,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level failure (connect refused, stream error, bad handshake).
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Handshake (or event-stream response) did not complete in time.
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    /// No pong arrived within the configured window.
    #[error("Keep-alive timeout after {timeout_ms}ms")]
    KeepAliveTimeout {
        /// Milliseconds waited for the pong.
        timeout_ms: u64,
    },

    // ========================================================================
    // Terminal Errors
    // ========================================================================
    /// Retry budget exhausted; requires an explicit `reconnect()`.
    #[error("Max reconnection attempts exceeded")]
    MaxRetriesExceeded {
        /// Retries performed before giving up.
        attempts: u32,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP error from the event-stream request.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// ParseError
// ============================================================================

/// Failure to decode an inbound frame.
///
/// Malformed frames are logged and dropped; they never close the connection.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The frame is not valid JSON.
    #[error("Malformed JSON frame: {0}")]
    Syntax(#[source] serde_json::Error),

    /// The frame is valid JSON but does not match the consumer's type.
    #[error("Unexpected frame shape: {0}")]
    Shape(#[source] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an already-open error.
    #[inline]
    pub fn already_open(session: SessionId) -> Self {
        Self::AlreadyOpen { session }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a keep-alive timeout error.
    #[inline]
    pub fn keepalive_timeout(timeout_ms: u64) -> Self {
        Self::KeepAliveTimeout { timeout_ms }
    }

    /// Creates a max-retries error.
    #[inline]
    pub fn max_retries_exceeded(attempts: u32) -> Self {
        Self::MaxRetriesExceeded { attempts }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::KeepAliveTimeout { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if the controller recovers from this error on its own.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.is_connection_error()
    }

    /// Returns `true` if recovery requires a consumer-initiated `reconnect()`.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
