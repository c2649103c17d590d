//! Transport layer.
//!
//! A [`TransportSession`] owns exactly one underlying handle (a WebSocket or
//! an HTTP event stream) and normalizes its activity into four events:
//! open, message, error and close. Sessions never retry on their own; the
//! controller drives reconnection for both transports under one policy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  create(sink)   ┌────────────────────┐
//! │ ConnectionController │────────────────►│  TransportFactory  │
//! │   (driver task)      │                 └─────────┬──────────┘
//! │                      │                           │
//! │                      │◄─── TransportEvent ───────┤ TransportSession
//! │                      │    (tagged SessionId)     │  ├ WebSocketSession
//! └──────────────────────┘                           │  └ EventStreamSession
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | Bidirectional session on `tokio-tungstenite` |
//! | `event_stream` | Receive-only Server-Sent Events session on `reqwest` |
//! | `sse` | Incremental `text/event-stream` parser |

// ============================================================================
// Submodules
// ============================================================================

/// Server-Sent Events session.
pub mod event_stream;

/// `text/event-stream` parser.
pub mod sse;

/// WebSocket session.
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

use crate::error::Result;
use crate::identifiers::SessionId;

// ============================================================================
// Re-exports
// ============================================================================

pub use event_stream::{EventStreamFactory, EventStreamSession};
pub use sse::{SseEvent, SseParser};
pub use websocket::{WebSocketFactory, WebSocketSession};

// ============================================================================
// Constants
// ============================================================================

/// Close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when no close frame was received.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code for a connection that dropped without a handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Default bound on connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[inline]
#[must_use]
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// TransportKind
// ============================================================================

/// Which transport a controller uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Bidirectional WebSocket.
    #[default]
    WebSocket,
    /// Receive-only Server-Sent Events.
    EventStream,
}

impl TransportKind {
    /// Diagnostic surfaced in the status after a transport error event.
    #[inline]
    #[must_use]
    pub const fn error_message(self) -> &'static str {
        match self {
            Self::WebSocket => "WebSocket connection error",
            Self::EventStream => "EventStream connection error",
        }
    }

    /// URL schemes this transport accepts.
    #[inline]
    #[must_use]
    pub const fn schemes(self) -> &'static [&'static str] {
        match self {
            Self::WebSocket => &["ws", "wss"],
            Self::EventStream => &["http", "https"],
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::EventStream => f.write_str("event_stream"),
        }
    }
}

// ============================================================================
// CloseInfo
// ============================================================================

/// How a transport handle closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Whether the closing handshake completed.
    pub was_clean: bool,
    /// Close code.
    pub code: u16,
    /// Reason text, possibly empty.
    pub reason: String,
}

impl CloseInfo {
    /// Intentional close (`1000`, clean).
    #[inline]
    #[must_use]
    pub fn clean() -> Self {
        Self {
            was_clean: true,
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }

    /// Dropped connection.
    #[inline]
    #[must_use]
    pub fn abnormal(code: u16, reason: impl Into<String>) -> Self {
        Self {
            was_clean: false,
            code,
            reason: reason.into(),
        }
    }

    /// Returns `true` only for a clean close with code `1000`.
    ///
    /// Everything else routes through the retry path.
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.was_clean && self.code == CLOSE_NORMAL
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Event emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Handle that produced the event.
    pub session: SessionId,
    /// What happened.
    pub kind: TransportEventKind,
}

/// Normalized transport activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// The handle is open.
    Open,
    /// One raw text frame.
    Message(String),
    /// Transport-level failure; always followed by an abnormal close.
    Error(String),
    /// The handle closed. Emitted at most once.
    Close(CloseInfo),
}

// ============================================================================
// EventSink
// ============================================================================

/// Channel a session reports through.
///
/// Tags every event with the session id and enforces that nothing follows
/// the close event.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    /// Creates a sink for `session`.
    #[must_use]
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            session,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Session this sink belongs to.
    #[inline]
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns `true` once the close event went out.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reports the handle as open.
    pub fn opened(&self) {
        self.emit(TransportEventKind::Open);
    }

    /// Reports one inbound text frame.
    pub fn message(&self, raw: impl Into<String>) {
        self.emit(TransportEventKind::Message(raw.into()));
    }

    /// Reports a transport failure.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(TransportEventKind::Error(message.into()));
    }

    /// Reports the close. Only the first call has an effect.
    pub fn closed(&self, info: CloseInfo) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send(TransportEventKind::Close(info));
    }

    fn emit(&self, kind: TransportEventKind) {
        if self.is_closed() {
            trace!(session = %self.session, ?kind, "Dropping event after close");
            return;
        }
        self.send(kind);
    }

    fn send(&self, kind: TransportEventKind) {
        // Receiver gone means the controller shut down.
        let _ = self.tx.send(TransportEvent {
            session: self.session,
            kind,
        });
    }
}

// ============================================================================
// ReadyState
// ============================================================================

/// Lifecycle of a single handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Created, `open` not yet called.
    Idle = 0,
    /// Handshake in progress.
    Connecting = 1,
    /// Frames flow.
    Open = 2,
    /// Close requested.
    Closing = 3,
    /// Done.
    Closed = 4,
}

impl ReadyState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomic cell holding a [`ReadyState`].
#[derive(Debug)]
pub struct ReadyStateCell(AtomicU8);

impl Default for ReadyStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ReadyState::Idle as u8))
    }
}

impl ReadyStateCell {
    /// Loads the current state.
    #[inline]
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores a new state.
    #[inline]
    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from` → `to`; returns `false` if the state was not `from`.
    #[inline]
    pub fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Closing` unless already closing or closed.
    /// Returns `true` if this call initiated the close.
    pub fn begin_close(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= ReadyState::Closing as u8 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                ReadyState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

// ============================================================================
// TransportSession / TransportFactory
// ============================================================================

/// One transport handle.
pub trait TransportSession: Send + Sync {
    /// Id this session tags its events with.
    fn id(&self) -> SessionId;

    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Current handle state.
    fn ready_state(&self) -> ReadyState;

    /// Starts connecting to `url`. Events follow through the sink.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyOpen`](crate::Error::AlreadyOpen) if called more than once.
    fn open(&self, url: &Url, protocols: &[String]) -> Result<()>;

    /// Sends one text frame.
    ///
    /// Returns `false` without queueing when the handle is not open.
    fn send(&self, payload: &str) -> bool;

    /// Requests a clean shutdown. A clean close event is reported even when
    /// the network is already gone.
    fn close(&self);
}

/// Creates sessions on behalf of a controller.
///
/// Controllers take the factory as a capability, so tests can substitute
/// scripted transports.
pub trait TransportFactory: Send + Sync + 'static {
    /// Builds an idle session reporting through `sink`.
    fn create(&self, sink: EventSink) -> Arc<dyn TransportSession>;
}

// ============================================================================
// Tests
// ============================================================================
