//! Server-Sent Events session.
//!
//! A receive-only transport: `send` always returns `false`. The browser-style
//! built-in reconnect is deliberately absent; any failure, including the
//! server ending the stream, is reported as an error followed by an abnormal
//! close so the controller's retry policy applies.
//!
//! The factory remembers the last event id across sessions and sends it as
//! `Last-Event-ID` on the next request.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::sse::SseParser;
use super::{
    CLOSE_ABNORMAL, CloseInfo, DEFAULT_CONNECT_TIMEOUT, EventSink, ReadyState, ReadyStateCell,
    TransportFactory, TransportKind, TransportSession, millis,
};

// ============================================================================
// Constants
// ============================================================================

/// MIME type every response must carry.
const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Header carrying the resume point.
const LAST_EVENT_ID: &str = "Last-Event-ID";

// ============================================================================
// EventStreamFactory
// ============================================================================

/// Creates [`EventStreamSession`]s sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct EventStreamFactory {
    client: Client,
    headers: Arc<Vec<(String, String)>>,
    last_event_id: Arc<Mutex<Option<String>>>,
    connect_timeout: Duration,
}

impl Default for EventStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamFactory {
    /// Creates a factory with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Creates a factory around an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            headers: Arc::new(Vec::new()),
            last_event_id: Arc::new(Mutex::new(None)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Adds headers sent with every request.
    #[must_use]
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers = Arc::new(headers.into_iter().collect());
        self
    }

    /// Bounds the wait for response headers. The body itself is unbounded.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Last event id observed by any session of this factory.
    #[must_use]
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }
}

impl TransportFactory for EventStreamFactory {
    fn create(&self, sink: EventSink) -> Arc<dyn TransportSession> {
        Arc::new(EventStreamSession {
            sink,
            client: self.client.clone(),
            headers: Arc::clone(&self.headers),
            last_event_id: Arc::clone(&self.last_event_id),
            connect_timeout: self.connect_timeout,
            state: Arc::new(ReadyStateCell::default()),
            stop: Mutex::new(None),
        })
    }
}

// ============================================================================
// EventStreamSession
// ============================================================================

/// One SSE handle.
pub struct EventStreamSession {
    sink: EventSink,
    client: Client,
    headers: Arc<Vec<(String, String)>>,
    last_event_id: Arc<Mutex<Option<String>>>,
    connect_timeout: Duration,
    state: Arc<ReadyStateCell>,
    /// Stops the reader task; dropping it has the same effect.
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl TransportSession for EventStreamSession {
    fn id(&self) -> SessionId {
        self.sink.session()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn open(&self, url: &Url, _protocols: &[String]) -> Result<()> {
        if !self.state.transition(ReadyState::Idle, ReadyState::Connecting) {
            return Err(Error::already_open(self.id()));
        }

        let mut request = self
            .client
            .get(url.clone())
            .header(ACCEPT, EVENT_STREAM_MIME)
            .header(CACHE_CONTROL, "no-cache");

        for (name, value) in self.headers.iter() {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(id) = self.last_event_id.lock().clone() {
            request = request.header(LAST_EVENT_ID, id);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop.lock() = Some(stop_tx);

        debug!(session = %self.id(), url = %url, "Opening event stream");
        let reader = StreamReader {
            sink: self.sink.clone(),
            state: Arc::clone(&self.state),
            last_event_id: Arc::clone(&self.last_event_id),
            connect_timeout: self.connect_timeout,
        };
        tokio::spawn(reader.run(request, stop_rx));

        Ok(())
    }

    fn send(&self, _payload: &str) -> bool {
        false
    }

    fn close(&self) {
        if !self.state.begin_close() {
            return;
        }

        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }

        self.state.set(ReadyState::Closed);
        debug!(session = %self.id(), "Event stream close requested");
        self.sink.closed(CloseInfo::clean());
    }
}

// ============================================================================
// Reader Task
// ============================================================================

/// State moved into the reader task.
struct StreamReader {
    sink: EventSink,
    state: Arc<ReadyStateCell>,
    last_event_id: Arc<Mutex<Option<String>>>,
    connect_timeout: Duration,
}

impl StreamReader {
    async fn run(self, request: reqwest::RequestBuilder, stop_rx: oneshot::Receiver<()>) {
        tokio::select! {
            result = self.read(request) => {
                if let Err(e) = result {
                    warn!(session = %self.sink.session(), error = %e, "Event stream failed");
                    self.fail(e.to_string());
                }
            }
            _ = stop_rx => {
                debug!(session = %self.sink.session(), "Event stream reader stopped");
            }
        }
    }

    /// Connects and pumps frames until the body ends.
    async fn read(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let session = self.sink.session();
        let response = timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| Error::connection_timeout(millis(self.connect_timeout)))??;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection(format!("Unexpected status {status}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM_MIME) {
            return Err(Error::connection(format!(
                "Unexpected content type '{content_type}'"
            )));
        }

        if !self
            .state
            .transition(ReadyState::Connecting, ReadyState::Open)
        {
            return Ok(());
        }

        info!(%session, "Event stream connected");
        self.sink.opened();

        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in parser.feed(&chunk) {
                if let Some(id) = &event.id {
                    *self.last_event_id.lock() = Some(id.clone());
                }
                if event.is_message() {
                    self.sink.message(event.data);
                } else {
                    trace!(%session, event = %event.event, "Ignoring named event");
                }
            }
        }

        Err(Error::connection("Event stream ended"))
    }

    fn fail(&self, message: String) {
        self.state.set(ReadyState::Closed);
        self.sink.error(message.clone());
        self.sink.closed(CloseInfo::abnormal(CLOSE_ABNORMAL, message));
    }
}

// ============================================================================
// Tests
// ============================================================================
