//! Controller builder.
//!
//! # Example
//!
//! ```ignore
//! let controller = ConnectionController::<serde_json::Value>::builder()
//!     .url("wss://api.example.com/ws")
//!     .max_retries(3)
//!     .ping_pong(true)
//!     .on_open(|| tracing::info!("live"))
//!     .on_message(|message| tracing::info!(data = ?message.data, "frame"))
//!     .spawn()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{
    CloseInfo, EventStreamFactory, TransportFactory, TransportKind, WebSocketFactory,
};
use crate::visibility::VisibilityCoordinator;

use super::core::ConnectionController;
use super::driver::{Driver, Shared};
use super::handlers::Handlers;
use super::options::{ConnectionOptions, parse_url};

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for [`ConnectionController`].
pub struct ConnectionBuilder<T> {
    options: ConnectionOptions,
    handlers: Handlers<T>,
    factory: Option<Arc<dyn TransportFactory>>,
    visibility: Option<VisibilityCoordinator>,
}

impl<T> Default for ConnectionBuilder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionBuilder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Creates a builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: ConnectionOptions::default(),
            handlers: Handlers::default(),
            factory: None,
            visibility: None,
        }
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Replaces all options at once.
    #[must_use]
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = Some(url.into());
        self
    }

    /// Sets the master switch.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.options.enabled = enabled;
        self
    }

    /// Selects the transport.
    #[must_use]
    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.options.transport = transport;
        self
    }

    /// Adds a WebSocket sub-protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.options.protocols.push(protocol.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.options.max_retries = max_retries;
        self
    }

    /// Sets the backoff base delay.
    #[must_use]
    pub fn retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.options.retry_delay_ms = delay_ms;
        self
    }

    /// Caps a single backoff delay.
    #[must_use]
    pub fn max_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.options.max_retry_delay_ms = Some(delay_ms);
        self
    }

    /// Enables or disables ping/pong keep-alive.
    #[must_use]
    pub fn ping_pong(mut self, enabled: bool) -> Self {
        self.options.enable_ping_pong = enabled;
        self
    }

    /// Sets keep-alive timings.
    #[must_use]
    pub fn keepalive_timings(mut self, interval_ms: u64, pong_timeout_ms: u64) -> Self {
        self.options.ping_interval_ms = interval_ms;
        self.options.pong_timeout_ms = pong_timeout_ms;
        self
    }

    /// Bounds the handshake or event-stream response wait.
    #[must_use]
    pub fn connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.connect_timeout_ms = timeout_ms;
        self
    }

    /// Whether to drop the transport while the host is backgrounded.
    #[must_use]
    pub fn pause_when_hidden(mut self, pause: bool) -> Self {
        self.options.pause_when_hidden = pause;
        self
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Called when a transport handle opens.
    #[must_use]
    pub fn on_open(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_open = Some(Box::new(handler));
        self
    }

    /// Called for every decoded application frame.
    #[must_use]
    pub fn on_message(mut self, handler: impl Fn(Message<T>) + Send + Sync + 'static) -> Self {
        self.handlers.on_message = Some(Box::new(handler));
        self
    }

    /// Called for transport errors, keep-alive timeouts and the terminal error.
    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.handlers.on_error = Some(Box::new(handler));
        self
    }

    /// Called when the server side ends the current transport handle.
    ///
    /// Closes the controller initiates itself, and closes that follow a
    /// transport error, are not reported; see [`CloseHandler`](super::handlers::CloseHandler).
    #[must_use]
    pub fn on_close(mut self, handler: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.handlers.on_close = Some(Box::new(handler));
        self
    }

    // ========================================================================
    // Collaborators
    // ========================================================================

    /// Replaces the transport factory chosen from the transport kind.
    #[must_use]
    pub fn factory(mut self, factory: impl TransportFactory) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Uses `coordinator` instead of the process-wide one.
    #[must_use]
    pub fn visibility(mut self, coordinator: VisibilityCoordinator) -> Self {
        self.visibility = Some(coordinator);
        self
    }

    // ========================================================================
    // Spawn
    // ========================================================================

    /// Validates the options and starts the controller.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no runtime is available or an option is invalid
    /// - [`Error::InvalidUrl`] if the URL does not fit the transport
    pub fn spawn(self) -> Result<ConnectionController<T>> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::config("spawn() must be called within a Tokio runtime"))?;

        self.options.validate()?;
        let url = self
            .options
            .url
            .as_deref()
            .map(|raw| parse_url(raw, self.options.transport))
            .transpose()?;

        let factory = self
            .factory
            .unwrap_or_else(|| default_factory(&self.options));
        let visibility = self.visibility.unwrap_or_else(VisibilityCoordinator::global);

        let shared = Arc::new(Mutex::new(Shared::new()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        debug!(
            transport = %self.options.transport,
            url = ?self.options.url,
            enabled = self.options.enabled,
            "Spawning connection controller"
        );

        let driver = Driver::new(
            &self.options,
            url,
            factory,
            self.handlers,
            visibility,
            Arc::clone(&shared),
            command_rx,
        );
        runtime.spawn(driver.run());

        Ok(ConnectionController::new(
            command_tx,
            shared,
            self.options.transport,
        ))
    }
}

/// Built-in factory for a transport kind.
fn default_factory(options: &ConnectionOptions) -> Arc<dyn TransportFactory> {
    let headers = options.headers.iter().cloned();
    match options.transport {
        TransportKind::WebSocket => Arc::new(
            WebSocketFactory::with_headers(headers).with_connect_timeout(options.connect_timeout()),
        ),
        TransportKind::EventStream => Arc::new(
            EventStreamFactory::new()
                .with_headers(headers)
                .with_connect_timeout(options.connect_timeout()),
        ),
    }
}
