//! WebSocket session.
//!
//! Each session spawns one tokio task that performs the handshake and then
//! runs the I/O loop. The public [`WebSocketSession`] only talks to that task
//! through a command channel, so `send` and `close` never block.
//!
//! # Event Loop
//!
//! The task multiplexes:
//!
//! - Inbound frames (text, binary-as-UTF-8, close)
//! - Outbound text frames from [`TransportSession::send`]
//! - Close requests from [`TransportSession::close`]
//!
//! Ping/pong control frames are answered by tungstenite itself.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, CloseInfo, DEFAULT_CONNECT_TIMEOUT, EventSink, ReadyState,
    ReadyStateCell, TransportFactory, TransportKind, TransportSession, millis,
};

// ============================================================================
// Types
// ============================================================================

/// Extra handshake headers, shared by every session of a factory.
type Headers = Arc<Vec<(String, String)>>;

/// Commands for the session task.
enum Outbound {
    /// Write one text frame.
    Text(String),
    /// Send a normal close frame and stop.
    Close,
}

// ============================================================================
// WebSocketFactory
// ============================================================================

/// Creates [`WebSocketSession`]s.
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    headers: Headers,
    connect_timeout: Duration,
}

impl Default for WebSocketFactory {
    fn default() -> Self {
        Self {
            headers: Arc::new(Vec::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WebSocketFactory {
    /// Creates a factory with no extra headers.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds headers sent with every handshake (e.g. `Authorization`).
    #[must_use]
    pub fn with_headers(headers: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            headers: Arc::new(headers.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Bounds the TCP connect plus upgrade handshake.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl TransportFactory for WebSocketFactory {
    fn create(&self, sink: EventSink) -> Arc<dyn TransportSession> {
        Arc::new(WebSocketSession::new(
            sink,
            Arc::clone(&self.headers),
            self.connect_timeout,
        ))
    }
}

// ============================================================================
// WebSocketSession
// ============================================================================

/// One WebSocket handle.
pub struct WebSocketSession {
    /// Where events go.
    sink: EventSink,
    /// Extra handshake headers.
    headers: Headers,
    /// Handshake deadline.
    connect_timeout: Duration,
    /// Handle lifecycle (shared with the task).
    state: Arc<ReadyStateCell>,
    /// Command channel to the task; `None` before open and after close.
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl WebSocketSession {
    fn new(sink: EventSink, headers: Headers, connect_timeout: Duration) -> Self {
        Self {
            sink,
            headers,
            connect_timeout,
            state: Arc::new(ReadyStateCell::default()),
            outbound: Mutex::new(None),
        }
    }
}

impl TransportSession for WebSocketSession {
    fn id(&self) -> SessionId {
        self.sink.session()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn open(&self, url: &Url, protocols: &[String]) -> Result<()> {
        if !self.state.transition(ReadyState::Idle, ReadyState::Connecting) {
            return Err(Error::already_open(self.id()));
        }

        let request = match build_request(url, protocols, &self.headers) {
            Ok(request) => request,
            Err(e) => {
                self.state.set(ReadyState::Closed);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);

        debug!(session = %self.id(), url = %url, "Opening WebSocket");
        tokio::spawn(run_session(
            request,
            self.connect_timeout,
            rx,
            self.sink.clone(),
            Arc::clone(&self.state),
        ));

        Ok(())
    }

    fn send(&self, payload: &str) -> bool {
        if self.state.get() != ReadyState::Open {
            return false;
        }

        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(Outbound::Text(payload.to_owned())).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        if !self.state.begin_close() {
            return;
        }

        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Outbound::Close);
        }

        debug!(session = %self.id(), "WebSocket close requested");
        self.sink.closed(CloseInfo::clean());
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Builds the client handshake request.
fn build_request(url: &Url, protocols: &[String], headers: &[(String, String)]) -> Result<Request> {
    let mut request = url.as_str().into_client_request()?;

    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| Error::config(format!("Invalid sub-protocol list: {e}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::config(format!("Invalid header value for '{name}': {e}")))?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}

// ============================================================================
// Session Task
// ============================================================================

/// Handshake plus I/O loop for one session.
async fn run_session(
    request: Request,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    sink: EventSink,
    state: Arc<ReadyStateCell>,
) {
    let session = sink.session();

    let ws_stream = tokio::select! {
        result = timeout(connect_timeout, connect_async(request)) => match result {
            Ok(Ok((stream, response))) => {
                debug!(%session, status = %response.status(), "WebSocket handshake completed");
                stream
            }
            Ok(Err(e)) => {
                warn!(%session, error = %e, "WebSocket connect failed");
                fail(&sink, &state, e.to_string());
                return;
            }
            Err(_) => {
                let e = Error::connection_timeout(millis(connect_timeout));
                warn!(%session, error = %e, "WebSocket handshake stalled");
                fail(&sink, &state, e.to_string());
                return;
            }
        },

        // Close requested (or session dropped) mid-handshake
        _ = outbound_rx.recv() => {
            debug!(%session, "Handshake abandoned");
            state.set(ReadyState::Closed);
            return;
        }
    };

    let (mut ws_write, mut ws_read) = ws_stream.split();

    if !state.transition(ReadyState::Connecting, ReadyState::Open) {
        let _ = ws_write.close().await;
        state.set(ReadyState::Closed);
        return;
    }

    info!(%session, "WebSocket connected");
    sink.opened();

    let close_info = loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        trace!(%session, len = text.len(), "Frame received");
                        sink.message(text.as_str());
                    }

                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => sink.message(text),
                        Err(_) => warn!(%session, len = data.len(), "Dropping non-UTF-8 binary frame"),
                    },

                    Some(Ok(Message::Close(frame))) => {
                        let info = match frame {
                            Some(frame) => CloseInfo {
                                was_clean: true,
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => CloseInfo {
                                was_clean: true,
                                code: CLOSE_NO_STATUS,
                                reason: String::new(),
                            },
                        };
                        debug!(%session, code = info.code, "WebSocket closed by remote");
                        break info;
                    }

                    Some(Err(e)) => {
                        warn!(%session, error = %e, "WebSocket error");
                        sink.error(e.to_string());
                        break CloseInfo::abnormal(CLOSE_ABNORMAL, e.to_string());
                    }

                    None => {
                        debug!(%session, "WebSocket stream ended");
                        break CloseInfo::abnormal(CLOSE_ABNORMAL, "stream ended");
                    }

                    // Ping, Pong and raw frames are handled by tungstenite
                    Some(Ok(_)) => {}
                }
            }

            command = outbound_rx.recv() => {
                match command {
                    Some(Outbound::Text(payload)) => {
                        if let Err(e) = ws_write.send(Message::Text(payload.into())).await {
                            warn!(%session, error = %e, "Failed to send frame");
                            sink.error(e.to_string());
                            break CloseInfo::abnormal(CLOSE_ABNORMAL, e.to_string());
                        }
                    }

                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static(""),
                        };
                        if let Err(e) = ws_write.send(Message::Close(Some(frame))).await {
                            debug!(%session, error = %e, "Close frame not delivered");
                        }
                        break CloseInfo::clean();
                    }
                }
            }
        }
    };

    let _ = ws_write.close().await;
    state.set(ReadyState::Closed);
    sink.closed(close_info);

    debug!(%session, "WebSocket session terminated");
}

/// Reports a failed handshake as an error followed by an abnormal close.
fn fail(sink: &EventSink, state: &ReadyStateCell, message: String) {
    state.set(ReadyState::Closed);
    sink.error(message.clone());
    sink.closed(CloseInfo::abnormal(CLOSE_ABNORMAL, message));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::transport::{TransportEvent, TransportEventKind};

    /// Local echo server. Replies `shutdown` with a normal close.
    async fn echo_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        match message {
                            Message::Text(text) if text.as_str() == "shutdown" => {
                                let frame = CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: Utf8Bytes::from_static("bye"),
                                };
                                let _ = ws.close(Some(frame)).await;
                            }
                            Message::Text(text) => {
                                let _ = ws.send(Message::Text(text)).await;
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        Url::parse(&format!("ws://{addr}")).expect("url")
    }

    fn session() -> (Arc<dyn TransportSession>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionId::next(), tx);
        (WebSocketFactory::new().create(sink), rx)
    }

    async fn next_kind(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEventKind {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within 5s")
            .expect("channel open")
            .kind
    }

    #[tokio::test]
    async fn test_open_send_receive_close() {
        let url = echo_server().await;
        let (session, mut rx) = session();

        assert!(!session.send("early"));
        session.open(&url, &[]).expect("open");
        assert_eq!(next_kind(&mut rx).await, TransportEventKind::Open);
        assert_eq!(session.ready_state(), ReadyState::Open);

        assert!(session.send(r#"{"a":1}"#));
        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::Message(r#"{"a":1}"#.into())
        );

        session.close();
        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::Close(CloseInfo::clean())
        );
        assert!(!session.send("late"));
    }

    #[tokio::test]
    async fn test_server_close_is_reported() {
        let url = echo_server().await;
        let (session, mut rx) = session();

        session.open(&url, &[]).expect("open");
        assert_eq!(next_kind(&mut rx).await, TransportEventKind::Open);
        assert!(session.send("shutdown"));

        match next_kind(&mut rx).await {
            TransportEventKind::Close(info) => {
                assert!(info.is_clean());
                assert_eq!(info.reason, "bye");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error_then_abnormal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        let (session, mut rx) = session();
        session.open(&url, &[]).expect("open");

        assert!(matches!(next_kind(&mut rx).await, TransportEventKind::Error(_)));
        match next_kind(&mut rx).await {
            TransportEventKind::Close(info) => {
                assert!(!info.was_clean);
                assert_eq!(info.code, CLOSE_ABNORMAL);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = WebSocketFactory::new()
            .with_connect_timeout(Duration::from_millis(100))
            .create(EventSink::new(SessionId::next(), tx));
        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        session.open(&url, &[]).expect("open");

        match next_kind(&mut rx).await {
            TransportEventKind::Error(message) => {
                assert_eq!(message, "Connection timed out after 100ms");
            }
            other => panic!("expected error, got {other:?}"),
        }
        match next_kind(&mut rx).await {
            TransportEventKind::Close(info) => assert_eq!(info.code, CLOSE_ABNORMAL),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(session.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let url = echo_server().await;
        let (session, _rx) = session();

        session.open(&url, &[]).expect("first open");
        let err = session.open(&url, &[]).unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen { .. }));
        session.close();
    }

    #[test]
    fn test_build_request_sets_protocols_and_headers() {
        let url = Url::parse("ws://127.0.0.1:9/live").expect("url");
        let headers = vec![("authorization".to_string(), "Bearer t".to_string())];
        let request = build_request(&url, &["v1".into(), "v2".into()], &headers).expect("request");

        assert_eq!(request.headers()[SEC_WEBSOCKET_PROTOCOL], "v1, v2");
        assert_eq!(request.headers()["authorization"], "Bearer t");
    }
}
