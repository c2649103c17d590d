//! Connection options.
//!
//! Plain, serializable configuration for one controller. Everything that is
//! not data (callbacks, custom factories, visibility coordinator) lives on
//! [`ConnectionBuilder`](super::ConnectionBuilder).
//!
//! # Example
//!
//! ```ignore
//! use livewire::ConnectionOptions;
//!
//! let options = ConnectionOptions::new("wss://api.example.com/ws")
//!     .with_max_retries(3)
//!     .with_retry_delay_ms(500)
//!     .with_ping_pong();
//!
//! let from_file = ConnectionOptions::from_json(r#"{"url":"wss://x/ws","maxRetries":2}"#)?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::keepalive::{DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT, KeepAliveConfig};
use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::transport::{DEFAULT_CONNECT_TIMEOUT, TransportKind};

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Recognized connection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Target endpoint; `None` means "do not connect".
    pub url: Option<String>,

    /// Master on/off switch.
    pub enabled: bool,

    /// Transport to use.
    pub transport: TransportKind,

    /// Sub-protocols offered during the WebSocket handshake.
    pub protocols: Vec<String>,

    /// Extra headers for the handshake / event-stream request.
    pub headers: Vec<(String, String)>,

    /// Reconnection attempts before the terminal error state.
    pub max_retries: u32,

    /// Base delay for the exponential backoff.
    pub retry_delay_ms: u64,

    /// Optional ceiling for a single backoff delay.
    pub max_retry_delay_ms: Option<u64>,

    /// Activates the ping/pong keep-alive.
    pub enable_ping_pong: bool,

    /// Interval between pings.
    pub ping_interval_ms: u64,

    /// Time allowed for a pong.
    pub pong_timeout_ms: u64,

    /// Drop the transport while the host is backgrounded.
    pub pause_when_hidden: bool,

    /// Bound on the handshake (WebSocket) or response headers (event stream).
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: None,
            enabled: true,
            transport: TransportKind::WebSocket,
            protocols: Vec::new(),
            headers: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_retry_delay_ms: None,
            enable_ping_pong: false,
            ping_interval_ms: DEFAULT_PING_INTERVAL.as_millis() as u64,
            pong_timeout_ms: DEFAULT_PONG_TIMEOUT.as_millis() as u64,
            pause_when_hidden: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options targeting `url` with defaults for everything else.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Parses options from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the endpoint.
    #[inline]
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the master switch.
    #[inline]
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Selects the transport.
    #[inline]
    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Adds a WebSocket sub-protocol.
    #[inline]
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Adds a request header.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the retry budget.
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff base delay.
    #[inline]
    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Caps a single backoff delay.
    #[inline]
    #[must_use]
    pub fn with_max_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_retry_delay_ms = Some(delay_ms);
        self
    }

    /// Enables ping/pong keep-alive with the current timings.
    #[inline]
    #[must_use]
    pub fn with_ping_pong(mut self) -> Self {
        self.enable_ping_pong = true;
        self
    }

    /// Sets keep-alive timings.
    #[inline]
    #[must_use]
    pub fn with_keepalive_timings(mut self, interval_ms: u64, pong_timeout_ms: u64) -> Self {
        self.ping_interval_ms = interval_ms;
        self.pong_timeout_ms = pong_timeout_ms;
        self
    }

    /// Sets the connection establishment bound.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Keeps the transport open while the host is backgrounded.
    #[inline]
    #[must_use]
    pub fn keep_alive_when_hidden(mut self) -> Self {
        self.pause_when_hidden = false;
        self
    }
}

// ============================================================================
// Derived Config
// ============================================================================

impl ConnectionOptions {
    /// Retry policy derived from the options.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms));
        match self.max_retry_delay_ms {
            Some(cap) => policy.with_max_delay(Duration::from_millis(cap)),
            None => policy,
        }
    }

    /// Keep-alive config derived from the options.
    #[must_use]
    pub fn keepalive_config(&self) -> KeepAliveConfig {
        KeepAliveConfig {
            enabled: self.enable_ping_pong,
            interval: Duration::from_millis(self.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
        }
    }

    /// Connection establishment bound.
    #[inline]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validates numeric options.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.retry_delay_ms == 0 {
            return Err(Error::config("retryDelayMs must be greater than 0"));
        }

        if self.max_retry_delay_ms == Some(0) {
            return Err(Error::config("maxRetryDelayMs must be greater than 0"));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::config("connectTimeoutMs must be greater than 0"));
        }

        if self.enable_ping_pong {
            if self.ping_interval_ms == 0 {
                return Err(Error::config("pingIntervalMs must be greater than 0"));
            }
            if self.pong_timeout_ms == 0 {
                return Err(Error::config("pongTimeoutMs must be greater than 0"));
            }
            if self.transport == TransportKind::EventStream {
                return Err(Error::config(
                    "enablePingPong requires a bidirectional transport",
                ));
            }
        }

        if let Some(url) = &self.url {
            parse_url(url, self.transport)?;
        }

        Ok(())
    }
}

/// Parses `raw` and checks its scheme against the transport.
///
/// # Errors
///
/// [`Error::InvalidUrl`] if it does not parse or the scheme does not fit.
pub fn parse_url(raw: &str, transport: TransportKind) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::invalid_url(raw, e.to_string()))?;

    if !transport.schemes().contains(&url.scheme()) {
        return Err(Error::invalid_url(
            raw,
            format!(
                "scheme '{}' is not supported by the {transport} transport",
                url.scheme()
            ),
        ));
    }

    Ok(url)
}

// ============================================================================
// Tests
// ============================================================================
