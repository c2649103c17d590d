//! Livewire - Resilient realtime connections.
//!
//! This library keeps a long-lived WebSocket or Server-Sent Events connection
//! alive on behalf of a consumer: it reconnects with exponential backoff,
//! detects dead links with an application-level ping/pong, and suspends the
//! transport while the host application is in the background.
//!
//! # Architecture
//!
//! Each [`ConnectionController`] spawns one driver task that owns:
//!
//! - **State machine**: disconnected / connecting / connected / reconnecting / error
//! - **Transport session**: created through a [`TransportFactory`], tagged with a [`SessionId`]
//! - **Timers**: retry deadline, ping interval, pong watchdog
//! - **Visibility subscription**: shared [`VisibilityCoordinator`], one system listener
//!
//! Key design principles:
//!
//! - Exactly one transport session per controller at any time
//! - Events from retired sessions are ignored
//! - Clean closes never reconnect; abnormal closes always consult the retry policy
//! - `close()` and disabling take effect before the call returns
//!
//! # Quick Start
//!
//! ```no_run
//! use livewire::{ConnectionController, ConnectionState, Result};
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let controller = ConnectionController::<Value>::builder()
//!         .url("wss://stream.example.com/ws")
//!         .max_retries(5)
//!         .ping_pong(true)
//!         .on_message(|message| println!("{}", message.data))
//!         .spawn()?;
//!
//!     controller.wait_for(ConnectionState::Connected).await;
//!     controller.send(r#"{"type":"subscribe","channel":"prices"}"#);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`controller`] | [`ConnectionController`], builder and options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`keepalive`] | Ping/pong monitor |
//! | [`message`] | Frame envelope decoding |
//! | [`retry`] | Backoff policy and scheduler |
//! | [`state`] | [`ConnectionState`] and [`Status`] |
//! | [`transport`] | WebSocket and event-stream sessions |
//! | [`visibility`] | Foreground/background coordination |

// ============================================================================
// Modules
// ============================================================================

/// Connection controller.
///
/// Use [`ConnectionController::builder()`] to create a managed connection.
pub mod controller;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Ping/pong keep-alive.
pub mod keepalive;

/// Frame envelopes.
pub mod message;

/// Exponential backoff.
pub mod retry;

/// Observable connection state.
pub mod state;

/// Transport sessions.
///
/// [`TransportFactory`] is the seam for substituting a transport.
pub mod transport;

/// Visibility coordination.
pub mod visibility;

// ============================================================================
// Re-exports
// ============================================================================

// Controller types
pub use controller::{ConnectionBuilder, ConnectionController, ConnectionOptions};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::SessionId;

// Keep-alive and retry types
pub use keepalive::{KeepAliveConfig, KeepAliveMonitor};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};

// Message types
pub use message::{Frame, Message};

// State types
pub use state::{ConnectionState, Status};

// Transport types
pub use transport::{
    CloseInfo, EventSink, EventStreamFactory, TransportFactory, TransportKind,
    TransportSession, WebSocketFactory,
};

// Visibility types
pub use visibility::{VisibilityCoordinator, VisibilitySource, VisibilitySubscription};
