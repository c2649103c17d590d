//! Scripted transport for controller tests.
//!
//! Sessions record what the controller does to them; tests drive the
//! transport side (accept, deliver, drop) explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::{
    CLOSE_ABNORMAL, CloseInfo, EventSink, ReadyState, ReadyStateCell, TransportFactory,
    TransportKind, TransportSession,
};

// ============================================================================
// MockFactory
// ============================================================================

#[derive(Clone, Default)]
pub(crate) struct MockFactory {
    kind: TransportKind,
    sessions: Arc<Mutex<Vec<Arc<MockSession>>>>,
}

impl MockFactory {
    /// Receive-only sessions reporting [`TransportKind::EventStream`].
    pub(crate) fn event_stream() -> Self {
        Self {
            kind: TransportKind::EventStream,
            ..Self::default()
        }
    }

    /// Number of sessions the controller opened.
    pub(crate) fn opened(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|session| session.url().is_some())
            .count()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock()[index])
    }

    pub(crate) fn last(&self) -> Arc<MockSession> {
        let sessions = self.sessions.lock();
        Arc::clone(sessions.last().expect("no session created"))
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter_map(|session| session.url())
            .collect()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, sink: EventSink) -> Arc<dyn TransportSession> {
        let session = Arc::new(MockSession {
            kind: self.kind,
            sink,
            state: ReadyStateCell::default(),
            url: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        });
        self.sessions.lock().push(Arc::clone(&session));
        session
    }
}

// ============================================================================
// MockSession
// ============================================================================

pub(crate) struct MockSession {
    kind: TransportKind,
    sink: EventSink,
    state: ReadyStateCell,
    url: Mutex<Option<String>>,
    sent: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
}

impl MockSession {
    pub(crate) fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Server accepted the handshake.
    pub(crate) fn accept(&self) {
        self.state.set(ReadyState::Open);
        self.sink.opened();
    }

    /// Server pushed a frame.
    pub(crate) fn deliver(&self, raw: &str) {
        self.sink.message(raw);
    }

    /// Connection dropped without a handshake.
    pub(crate) fn drop_connection(&self) {
        self.state.set(ReadyState::Closed);
        self.sink.closed(CloseInfo::abnormal(CLOSE_ABNORMAL, "dropped"));
    }

    /// Transport error followed by an abnormal close.
    pub(crate) fn fail(&self, message: &str) {
        self.state.set(ReadyState::Closed);
        self.sink.error(message);
        self.sink.closed(CloseInfo::abnormal(CLOSE_ABNORMAL, message));
    }

    /// Server closed with 1000.
    pub(crate) fn server_close(&self) {
        self.state.set(ReadyState::Closed);
        self.sink.closed(CloseInfo::clean());
    }
}

impl TransportSession for MockSession {
    fn id(&self) -> SessionId {
        self.sink.session()
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn open(&self, url: &Url, _protocols: &[String]) -> Result<()> {
        if !self.state.transition(ReadyState::Idle, ReadyState::Connecting) {
            return Err(Error::already_open(self.id()));
        }
        *self.url.lock() = Some(url.to_string());
        Ok(())
    }

    fn send(&self, payload: &str) -> bool {
        if self.kind == TransportKind::EventStream || self.state.get() != ReadyState::Open {
            return false;
        }
        self.sent.lock().push(payload.to_owned());
        true
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.state.begin_close() {
            return;
        }
        self.state.set(ReadyState::Closed);
        self.sink.closed(CloseInfo::clean());
    }
}
