//! Controller event loop.
//!
//! One driver task per controller owns the state machine, the current
//! transport session and every timer. All inputs are multiplexed in a single
//! `tokio::select!`, so transitions never interleave.
//!
//! # Inputs
//!
//! | Input | Source |
//! |-------|--------|
//! | Commands | [`ConnectionController`](super::ConnectionController) handle |
//! | Transport events | current session's [`EventSink`] |
//! | Retry deadline | [`RetryScheduler`] decision |
//! | Ping / pong deadlines | [`KeepAliveMonitor`] |
//! | Visibility changes | [`VisibilitySubscription`] |
//!
//! Timers are plain deadlines. Leaving the state that armed one clears it;
//! when the driver exits nothing stays armed.
//!
//! # Epochs
//!
//! Handle commands bump a shared epoch before they are queued. The driver
//! adopts the epoch when it processes the command and refuses to publish
//! status or deliver frames while the shared epoch is ahead of it. That is
//! what makes `close()` take effect synchronously for the caller.

// ============================================================================
// Imports
// ============================================================================

use std::future::pending;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, MAX_RETRIES_EXCEEDED};
use crate::identifiers::SessionId;
use crate::keepalive::KeepAliveMonitor;
use crate::message::{Frame, Message, decode};
use crate::retry::{RetryDecision, RetryScheduler, deadline_after};
use crate::state::{ConnectionState, Status};
use crate::transport::{
    CloseInfo, EventSink, TransportEvent, TransportEventKind, TransportFactory, TransportKind,
    TransportSession, millis,
};
use crate::visibility::{VisibilityCoordinator, VisibilitySubscription};

use super::handlers::Handlers;
use super::options::ConnectionOptions;

// ============================================================================
// Shared
// ============================================================================

/// State shared between the handle and the driver.
pub(crate) struct Shared {
    /// Last published status.
    pub(crate) status: Status,
    /// Bumped by every handle command.
    pub(crate) epoch: u64,
    /// Session `send` may use; set only while connected.
    pub(crate) session: Option<Arc<dyn TransportSession>>,
    /// Status observers.
    pub(crate) watch: watch::Sender<Status>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (watch, _) = watch::channel(Status::default());
        Self {
            status: Status::default(),
            epoch: 0,
            session: None,
            watch,
        }
    }

    /// Stores and broadcasts `status` if it changed.
    pub(crate) fn publish(&mut self, status: Status) {
        if self.status != status {
            self.status = status.clone();
            self.watch.send_replace(status);
        }
    }
}

// ============================================================================
// Command
// ============================================================================

/// Requests from the handle, tagged with the epoch they created.
#[derive(Debug)]
pub(crate) enum Command {
    /// Consumer-initiated clean close.
    Close,
    /// Tear down and start fresh.
    Reconnect,
    /// Point at a new endpoint (or none).
    SetUrl(Option<Url>),
    /// Flip the master switch.
    SetEnabled(bool),
    /// Handle dropped.
    Shutdown,
}

pub(crate) type CommandRx = mpsc::UnboundedReceiver<(u64, Command)>;

// ============================================================================
// Driver
// ============================================================================

/// Owns everything that changes over a controller's lifetime.
pub(crate) struct Driver<T> {
    shared: Arc<Mutex<Shared>>,
    commands: CommandRx,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    factory: Arc<dyn TransportFactory>,
    handlers: Handlers<T>,
    coordinator: VisibilityCoordinator,
    visibility: Option<VisibilitySubscription>,

    url: Option<Url>,
    enabled: bool,
    protocols: Vec<String>,
    pause_when_hidden: bool,

    session: Option<Arc<dyn TransportSession>>,
    state: ConnectionState,
    error: Option<String>,
    retry: RetryScheduler,
    retry_at: Option<Instant>,
    keepalive: KeepAliveMonitor,
    /// Connection wanted but held back because the host is hidden.
    suspended: bool,
    epoch: u64,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Driver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        options: &ConnectionOptions,
        url: Option<Url>,
        factory: Arc<dyn TransportFactory>,
        handlers: Handlers<T>,
        coordinator: VisibilityCoordinator,
        shared: Arc<Mutex<Shared>>,
        commands: CommandRx,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            shared,
            commands,
            events_tx,
            events_rx,
            factory,
            handlers,
            coordinator,
            visibility: None,
            url,
            enabled: options.enabled,
            protocols: options.protocols.clone(),
            pause_when_hidden: options.pause_when_hidden,
            session: None,
            state: ConnectionState::Disconnected,
            error: None,
            retry: RetryScheduler::new(options.retry_policy()),
            retry_at: None,
            keepalive: KeepAliveMonitor::new(options.keepalive_config()),
            suspended: false,
            epoch: 0,
            _payload: PhantomData,
        }
    }

    /// Runs until the handle is dropped.
    pub(crate) async fn run(mut self) {
        if self.enabled {
            self.visibility = Some(self.coordinator.subscribe());
        }
        self.connect();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some((_, Command::Shutdown)) | None => break,
                        Some((epoch, command)) => {
                            self.epoch = epoch;
                            self.handle_command(command);
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => self.handle_event(event),

                () = sleep_until_opt(self.retry_at) => self.on_retry_due(),

                () = sleep_until_opt(self.keepalive.pong_deadline()) => self.on_pong_timeout(),

                () = sleep_until_opt(self.keepalive.next_ping()) => self.on_ping_due(),

                visible = next_visibility(self.visibility.as_mut()) => self.on_visibility(visible),
            }
        }

        self.shutdown();
    }
}

// ============================================================================
// Driver - Commands
// ============================================================================

impl<T> Driver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn handle_command(&mut self, command: Command) {
        debug!(?command, "Command received");

        match command {
            Command::Close => {
                self.stop();
                self.error = None;
                self.state = ConnectionState::Disconnected;
                self.sync();
            }

            Command::Reconnect => {
                self.stop();
                if self.state == ConnectionState::Error {
                    self.retry.reset();
                }
                self.error = None;
                self.connect();
            }

            Command::SetUrl(url) => {
                if url == self.url {
                    return;
                }
                self.url = url;
                if self.enabled {
                    self.stop();
                    self.retry.reset();
                    self.error = None;
                    self.connect();
                }
            }

            Command::SetEnabled(enabled) => {
                if enabled == self.enabled {
                    return;
                }
                self.enabled = enabled;

                if enabled {
                    self.visibility = Some(self.coordinator.subscribe());
                    self.retry.reset();
                    self.error = None;
                    self.connect();
                } else {
                    self.stop();
                    self.visibility = None;
                    self.error = None;
                    self.state = ConnectionState::Disconnected;
                    self.sync();
                }
            }

            // Intercepted by the run loop
            Command::Shutdown => {}
        }
    }
}

// ============================================================================
// Driver - Transport Events
// ============================================================================

impl<T> Driver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn handle_event(&mut self, event: TransportEvent) {
        let Some(kind) = self.current_kind(event.session) else {
            trace!(session = %event.session, "Ignoring event from retired session");
            return;
        };

        match event.kind {
            TransportEventKind::Open => self.on_open(),
            TransportEventKind::Message(raw) => self.on_frame(event.session, &raw),
            TransportEventKind::Error(message) => self.on_transport_error(kind, message),
            TransportEventKind::Close(info) => self.on_close(info),
        }
    }

    fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        self.retry.reset();
        self.retry_at = None;
        self.error = None;
        self.state = ConnectionState::Connected;
        self.keepalive.start(Instant::now());

        info!(url = ?self.url.as_ref().map(Url::as_str), "Connected");
        self.sync();
        if self.is_live_epoch() {
            self.handlers.open();
        }
    }

    fn on_frame(&mut self, session: SessionId, raw: &str) {
        match decode::<T>(raw) {
            Ok(Frame::Pong) => {
                self.keepalive.on_pong();
            }
            Ok(Frame::Ping) => {
                trace!(%session, "Ignoring inbound ping envelope");
            }
            Ok(Frame::Data(data)) => {
                if self.is_live_epoch() {
                    self.handlers.message(Message { session, data });
                }
            }
            Err(e) => {
                warn!(%session, error = %e, "Dropping malformed frame");
            }
        }
    }

    fn on_transport_error(&mut self, kind: TransportKind, message: String) {
        warn!(error = %message, "Transport error");
        self.error = Some(kind.error_message().to_owned());
        if self.is_live_epoch() {
            self.handlers.error(&Error::connection(message));
        }
        self.on_abnormal_close();
    }

    fn on_close(&mut self, info: CloseInfo) {
        if self.is_live_epoch() {
            self.handlers.close(&info);
        }

        if info.is_clean() {
            info!(code = info.code, "Connection closed");
            self.stop();
            self.state = ConnectionState::Disconnected;
            self.sync();
        } else {
            debug!(code = info.code, reason = %info.reason, "Connection closed abnormally");
            self.on_abnormal_close();
        }
    }

    /// Retires the session and consults the scheduler.
    fn on_abnormal_close(&mut self) {
        self.teardown_session();
        self.state = ConnectionState::Reconnecting;

        match self.retry.on_abnormal_close() {
            RetryDecision::Retry { delay, attempt } => {
                info!(attempt, delay_ms = millis(delay), "Scheduling reconnect");
                self.retry_at = Some(deadline_after(Instant::now(), delay));
                self.sync();
            }
            RetryDecision::GiveUp => {
                let attempts = self.retry.attempt();
                warn!(attempts, "Giving up reconnecting");
                self.retry_at = None;
                self.state = ConnectionState::Error;
                self.error = Some(MAX_RETRIES_EXCEEDED.to_owned());
                self.sync();
                if self.is_live_epoch() {
                    self.handlers.error(&Error::max_retries_exceeded(attempts));
                }
            }
        }
    }
}

// ============================================================================
// Driver - Timers & Visibility
// ============================================================================

impl<T> Driver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn on_retry_due(&mut self) {
        self.retry_at = None;
        debug!(attempt = self.retry.attempt(), "Retry timer fired");
        self.connect();
    }

    fn on_ping_due(&mut self) {
        let Some(session) = self.session.clone() else {
            self.keepalive.stop();
            return;
        };

        if !self.keepalive.ping(Instant::now(), |frame| session.send(frame)) {
            debug!(session = %session.id(), "Ping not sent");
        }
    }

    fn on_pong_timeout(&mut self) {
        let timeout_ms = millis(self.keepalive.config().pong_timeout);
        warn!(timeout_ms, "No pong received, forcing reconnect");

        self.keepalive.stop();
        if self.is_live_epoch() {
            self.handlers.error(&Error::keepalive_timeout(timeout_ms));
        }
        self.on_abnormal_close();
    }

    fn on_visibility(&mut self, visible: bool) {
        debug!(visible, "Visibility update");
        if !self.pause_when_hidden {
            return;
        }

        if !visible {
            if self.state.is_active() {
                info!("Host hidden, suspending connection");
                self.stop();
                self.suspended = true;
                self.state = ConnectionState::Disconnected;
                self.sync();
            }
        } else if self.suspended {
            info!("Host visible, resuming connection");
            self.retry.reset();
            self.connect();
        }
    }
}

// ============================================================================
// Driver - Session Management
// ============================================================================

impl<T> Driver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Opens a session if enabled, targeted and allowed by visibility.
    fn connect(&mut self) {
        let Some(url) = self.url.clone().filter(|_| self.enabled) else {
            self.state = ConnectionState::Disconnected;
            self.sync();
            return;
        };

        if self.pause_when_hidden && !self.is_visible() {
            debug!("Host hidden, deferring connect");
            self.suspended = true;
            self.state = ConnectionState::Disconnected;
            self.sync();
            return;
        }

        self.suspended = false;
        self.open_session(url);
    }

    fn open_session(&mut self, url: Url) {
        self.teardown_session();

        let id = SessionId::next();
        let session = self
            .factory
            .create(EventSink::new(id, self.events_tx.clone()));
        self.state = ConnectionState::Connecting;

        debug!(session = %id, url = %url, "Opening transport");
        match session.open(&url, &self.protocols) {
            Ok(()) => {
                self.session = Some(session);
                self.sync();
            }
            Err(e) => {
                error!(session = %id, error = %e, "Transport refused to open");
                if self.is_live_epoch() {
                    self.handlers.error(&e);
                }
                self.on_abnormal_close();
            }
        }
    }

    /// Closes and forgets the current session.
    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(session = %session.id(), "Retiring session");
            session.close();
        }
        self.keepalive.stop();
    }

    /// Tears down the session and cancels every pending timer.
    fn stop(&mut self) {
        self.teardown_session();
        self.retry_at = None;
        self.suspended = false;
    }

    fn shutdown(&mut self) {
        self.stop();
        self.visibility = None;
        self.state = ConnectionState::Disconnected;

        let mut shared = self.shared.lock();
        shared.session = None;
        shared.publish(Status {
            state: ConnectionState::Disconnected,
            retry_count: self.retry.attempt(),
            error: None,
        });

        debug!("Controller driver stopped");
    }

    fn current_kind(&self, id: SessionId) -> Option<TransportKind> {
        self.session
            .as_ref()
            .filter(|session| session.id() == id)
            .map(|session| session.kind())
    }

    fn is_visible(&self) -> bool {
        self.visibility
            .as_ref()
            .is_none_or(VisibilitySubscription::is_visible)
    }

    /// `false` while a newer handle command is queued; callbacks and
    /// status updates are held back until the driver has caught up.
    fn is_live_epoch(&self) -> bool {
        self.shared.lock().epoch == self.epoch
    }

    /// Publishes the driver's view unless a newer handle command is pending.
    fn sync(&self) {
        let mut shared = self.shared.lock();
        if shared.epoch != self.epoch {
            return;
        }

        shared.session = match self.state {
            ConnectionState::Connected => self.session.clone(),
            _ => None,
        };
        shared.publish(Status {
            state: self.state,
            retry_count: self.retry.attempt(),
            error: self.error.clone(),
        });
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Next visibility change, or never when unsubscribed.
async fn next_visibility(subscription: Option<&mut VisibilitySubscription>) -> bool {
    match subscription {
        Some(subscription) => subscription.changed().await,
        None => pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
