//! Consumer callbacks.
//!
//! Every callback runs inside `catch_unwind`: a panicking consumer is logged
//! and the connection keeps going.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

use crate::error::Error;
use crate::message::Message;
use crate::transport::CloseInfo;

// ============================================================================
// Types
// ============================================================================

/// Called when a transport handle opens.
pub type OpenHandler = Box<dyn Fn() + Send + Sync>;

/// Called for every decoded application frame, in arrival order.
pub type MessageHandler<T> = Box<dyn Fn(Message<T>) + Send + Sync>;

/// Called for transport errors, keep-alive timeouts and the terminal error.
pub type ErrorHandler = Box<dyn Fn(&Error) + Send + Sync>;

/// Called when the current transport handle reports a close on its own.
///
/// Fires for a clean server close (`1000`, no retry) and for a bare abnormal
/// close (dropped connection, retry follows). It does not fire when:
///
/// - a transport error preceded the close; `on_error` reports that failure
///   and the trailing close belongs to an already retired session
/// - the pong deadline expired; the controller closes the session itself
/// - the consumer called `close()`, changed the URL, disabled or dropped the
///   controller
/// - a newer handle command is still queued for the driver
pub type CloseHandler = Box<dyn Fn(&CloseInfo) + Send + Sync>;

// ============================================================================
// Handlers
// ============================================================================

/// The set of consumer callbacks for one controller.
pub struct Handlers<T> {
    pub(crate) on_open: Option<OpenHandler>,
    pub(crate) on_message: Option<MessageHandler<T>>,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) on_close: Option<CloseHandler>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self {
            on_open: None,
            on_message: None,
            on_error: None,
            on_close: None,
        }
    }
}

impl<T> Handlers<T> {
    pub(crate) fn open(&self) {
        if let Some(handler) = &self.on_open {
            guard("on_open", || handler());
        }
    }

    pub(crate) fn message(&self, message: Message<T>) {
        if let Some(handler) = &self.on_message {
            guard("on_message", || handler(message));
        }
    }

    pub(crate) fn error(&self, err: &Error) {
        if let Some(handler) = &self.on_error {
            guard("on_error", || handler(err));
        }
    }

    pub(crate) fn close(&self, info: &CloseInfo) {
        if let Some(handler) = &self.on_close {
            guard("on_close", || handler(info));
        }
    }
}

/// Runs a consumer callback, containing panics.
fn guard(callback: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!(callback, panic = %detail, "Consumer callback panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================
