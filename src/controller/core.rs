//! Consumer-facing connection handle.
//!
//! [`ConnectionController`] is cheap to query and never blocks: state reads
//! come from a shared snapshot, commands are queued to the driver task.
//! Dropping the handle shuts the driver down, closing the transport and
//! cancelling every timer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::Result;
use crate::state::{ConnectionState, Status};
use crate::transport::TransportKind;

use super::builder::ConnectionBuilder;
use super::driver::{Command, Shared};
use super::options::parse_url;

// ============================================================================
// ConnectionController
// ============================================================================

/// Handle to one managed live connection.
///
/// `T` is the payload type application frames decode into.
///
/// # Example
///
/// ```ignore
/// let controller = ConnectionController::<serde_json::Value>::builder()
///     .url("wss://api.example.com/ws")
///     .on_message(|message| println!("{:?}", message.data))
///     .spawn()?;
///
/// controller.wait_for(ConnectionState::Connected).await;
/// controller.send(r#"{"type":"subscribe","channel":"prices"}"#);
/// ```
pub struct ConnectionController<T = Value> {
    commands: mpsc::UnboundedSender<(u64, Command)>,
    shared: Arc<Mutex<Shared>>,
    transport: TransportKind,
    _payload: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ConnectionController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("transport", &self.transport)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T> ConnectionController<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> ConnectionBuilder<T> {
        ConnectionBuilder::new()
    }
}

impl<T> ConnectionController<T> {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<(u64, Command)>,
        shared: Arc<Mutex<Shared>>,
        transport: TransportKind,
    ) -> Self {
        Self {
            commands,
            shared,
            transport,
            _payload: PhantomData,
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Returns the current status snapshot.
    #[must_use]
    pub fn status(&self) -> Status {
        self.shared.lock().status.clone()
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().status.state
    }

    /// Returns the number of retries since the last successful open.
    #[inline]
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.shared.lock().status.retry_count
    }

    /// Returns the last error message, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.shared.lock().status.error.clone()
    }

    /// Returns `true` while the transport is open.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns the transport this controller uses.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<Status> {
        self.shared.lock().watch.subscribe()
    }

    /// Waits until the connection reaches `state` and returns that status.
    pub async fn wait_for(&self, state: ConnectionState) -> Status {
        let mut changes = self.state_changes();
        match changes.wait_for(|status| status.state == state).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Sends a text frame.
    ///
    /// Returns `false` without side effects unless the connection is open.
    pub fn send(&self, payload: &str) -> bool {
        let session = {
            let shared = self.shared.lock();
            if shared.status.state != ConnectionState::Connected {
                trace!(state = %shared.status.state, "Send skipped, not connected");
                return false;
            }
            shared.session.clone()
        };

        session.is_some_and(|session| session.send(payload))
    }

    /// Serializes `value` and sends it.
    ///
    /// # Errors
    ///
    /// [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn send_json<S: Serialize>(&self, value: &S) -> Result<bool> {
        let payload = serde_json::to_string(value)?;
        Ok(self.send(&payload))
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Closes the connection. Takes effect before returning; no reconnection
    /// is attempted.
    pub fn close(&self) {
        self.dispatch(Command::Close, disconnect);
    }

    /// Tears down any transport and connects again.
    ///
    /// From the terminal error state this also resets the retry counter.
    pub fn reconnect(&self) {
        self.dispatch(Command::Reconnect, |_| {});
    }

    /// Points the connection at a new endpoint, or at none.
    ///
    /// A different URL closes the current transport and opens exactly one
    /// new one.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUrl`](crate::Error::InvalidUrl) if `url` does not parse
    /// or does not fit the transport.
    pub fn set_url(&self, url: Option<&str>) -> Result<()> {
        let url = url.map(|raw| parse_url(raw, self.transport)).transpose()?;
        self.dispatch(Command::SetUrl(url), |_| {});
        Ok(())
    }

    /// Flips the master switch. Disabling takes effect before returning.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.dispatch(Command::SetEnabled(true), |_| {});
        } else {
            self.dispatch(Command::SetEnabled(false), disconnect);
        }
    }

    /// Bumps the epoch, applies `update` and queues `command` atomically.
    fn dispatch(&self, command: Command, update: impl FnOnce(&mut Shared)) {
        let mut shared = self.shared.lock();
        shared.epoch += 1;
        update(&mut shared);

        let epoch = shared.epoch;
        if self.commands.send((epoch, command)).is_err() {
            debug!("Controller driver already stopped");
        }
    }
}

impl<T> Drop for ConnectionController<T> {
    fn drop(&mut self) {
        let epoch = self.shared.lock().epoch;
        let _ = self.commands.send((epoch, Command::Shutdown));
    }
}

/// Synchronous half of a consumer-initiated stop.
fn disconnect(shared: &mut Shared) {
    shared.session = None;
    let status = Status {
        state: ConnectionState::Disconnected,
        retry_count: shared.status.retry_count,
        error: None,
    };
    shared.publish(status);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::advance;

    use crate::controller::ConnectionOptions;
    use crate::error::{Error, MAX_RETRIES_EXCEEDED};
    use crate::message::{PING_FRAME, PONG_FRAME};
    use crate::transport::CloseInfo;
    use crate::transport::mock::MockFactory;
    use crate::visibility::VisibilityCoordinator;

    const URL: &str = "ws://example.test/live";
    const OTHER_URL: &str = "ws://example.test/other";
    const SSE_URL: &str = "https://example.test/events";

    /// Lets the driver drain everything queued so far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    struct Harness {
        factory: MockFactory,
        visibility: VisibilityCoordinator,
        messages: Arc<Mutex<Vec<Value>>>,
        errors: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<Vec<CloseInfo>>>,
        opens: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_factory(MockFactory::default())
        }

        fn with_factory(factory: MockFactory) -> Self {
            Self {
                factory,
                visibility: VisibilityCoordinator::new(),
                messages: Arc::default(),
                errors: Arc::default(),
                closes: Arc::default(),
                opens: Arc::default(),
            }
        }

        fn spawn(&self, options: ConnectionOptions) -> ConnectionController {
            let messages = Arc::clone(&self.messages);
            let errors = Arc::clone(&self.errors);
            let closes = Arc::clone(&self.closes);
            let opens = Arc::clone(&self.opens);

            ConnectionController::builder()
                .options(options)
                .factory(self.factory.clone())
                .visibility(self.visibility.clone())
                .on_open(move || {
                    opens.fetch_add(1, Ordering::SeqCst);
                })
                .on_message(move |message| messages.lock().push(message.data))
                .on_error(move |e: &Error| errors.lock().push(e.to_string()))
                .on_close(move |info: &CloseInfo| closes.lock().push(info.clone()))
                .spawn()
                .expect("spawn controller")
        }

        /// Spawns with `options` and accepts the first session.
        async fn connected(&self, options: ConnectionOptions) -> ConnectionController {
            let controller = self.spawn(options);
            settle().await;
            self.factory.last().accept();
            settle().await;
            assert_eq!(controller.state(), ConnectionState::Connected);
            controller
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_reports_open() {
        let harness = Harness::new();
        let controller = harness.spawn(ConnectionOptions::new(URL));
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(harness.factory.urls(), vec![URL.to_string()]);

        harness.factory.last().accept();
        let status = controller.wait_for(ConnectionState::Connected).await;
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.error, None);
        assert_eq!(harness.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_url_stays_disconnected() {
        let harness = Harness::new();
        let controller = harness.spawn(ConnectionOptions::default());
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_server_close_does_not_retry() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        harness.factory.last().server_close();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.closes.lock().as_slice(), &[CloseInfo::clean()]);

        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 1);
        assert_eq!(controller.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_schedules_retry() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        harness.factory.last().drop_connection();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Reconnecting);
        assert_eq!(controller.retry_count(), 1);
        assert_eq!(harness.factory.opened(), 1);
        assert_eq!(harness.closes.lock().len(), 1);
        assert!(!harness.closes.lock()[0].is_clean());

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 2);
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(controller.retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles() {
        let harness = Harness::new();
        let controller = harness
            .connected(ConnectionOptions::new(URL).with_retry_delay_ms(100))
            .await;

        harness.factory.last().drop_connection();
        settle().await;
        advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 2);

        harness.factory.last().drop_connection();
        settle().await;
        assert_eq!(controller.retry_count(), 2);

        advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 2);

        advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let harness = Harness::new();
        let controller = harness
            .connected(
                ConnectionOptions::new(URL)
                    .with_max_retries(2)
                    .with_retry_delay_ms(100),
            )
            .await;

        for _ in 0..2 {
            harness.factory.last().drop_connection();
            settle().await;
            advance(Duration::from_millis(500)).await;
            settle().await;
        }
        assert_eq!(harness.factory.opened(), 3);

        harness.factory.last().drop_connection();
        settle().await;

        let status = controller.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.error.as_deref(), Some(MAX_RETRIES_EXCEEDED));
        assert_eq!(status.retry_count, 2);
        assert!(
            harness
                .errors
                .lock()
                .iter()
                .any(|e| e == MAX_RETRIES_EXCEEDED)
        );

        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 3);
        assert_eq!(controller.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_retry_count() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        harness.factory.last().drop_connection();
        settle().await;
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(controller.retry_count(), 1);

        harness.factory.last().accept();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(controller.retry_count(), 0);
        assert_eq!(harness.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_sets_message_and_retries() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        harness.factory.last().fail("connection reset");
        settle().await;

        let status = controller.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.error.as_deref(), Some("WebSocket connection error"));
        assert_eq!(status.retry_count, 1);
        assert_eq!(harness.errors.lock().len(), 1);
        assert!(harness.closes.lock().is_empty());

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_error_resets_count() {
        let harness = Harness::new();
        let controller = harness
            .connected(
                ConnectionOptions::new(URL)
                    .with_max_retries(1)
                    .with_retry_delay_ms(100),
            )
            .await;

        harness.factory.last().drop_connection();
        settle().await;
        advance(Duration::from_millis(100)).await;
        settle().await;
        harness.factory.last().drop_connection();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Error);

        controller.reconnect();
        settle().await;

        let status = controller.status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.error, None);
        assert_eq!(harness.factory.opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_connection() {
        let harness = Harness::new();
        let controller = harness.spawn(ConnectionOptions::new(URL));
        settle().await;
        assert!(!controller.send("early"));

        harness.factory.last().accept();
        settle().await;
        assert!(controller.send("hello"));
        assert!(controller.send_json(&json!({"type": "subscribe"})).expect("json"));
        assert_eq!(
            harness.factory.last().sent(),
            vec!["hello".to_string(), r#"{"type":"subscribe"}"#.to_string()]
        );

        controller.close();
        assert!(!controller.send("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_delivered_in_order() {
        let harness = Harness::new();
        let _controller = harness.connected(ConnectionOptions::new(URL)).await;

        let session = harness.factory.last();
        session.deliver(r#"{"n":1}"#);
        session.deliver(r#"{"n":2}"#);
        session.deliver(r#"{"n":3}"#);
        settle().await;

        assert_eq!(
            harness.messages.lock().as_slice(),
            &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        let session = harness.factory.last();
        session.deliver("not json");
        session.deliver(r#"{"ok":true}"#);
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(harness.messages.lock().as_slice(), &[json!({"ok": true})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping_and_pong() {
        let harness = Harness::new();
        let controller = harness
            .connected(ConnectionOptions::new(URL).with_ping_pong())
            .await;
        let session = harness.factory.last();

        advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(session.sent(), vec![PING_FRAME.to_string()]);

        session.deliver(PONG_FRAME);
        settle().await;
        assert!(harness.messages.lock().is_empty());

        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(harness.factory.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_forces_reconnect() {
        let harness = Harness::new();
        let controller = harness
            .connected(ConnectionOptions::new(URL).with_ping_pong())
            .await;
        let session = harness.factory.last();

        advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(session.sent().len(), 1);

        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Reconnecting);
        assert_eq!(session.close_calls(), 1);
        assert_eq!(controller.retry_count(), 1);
        assert!(harness.errors.lock().iter().any(|e| e.contains("5000")));
        assert!(harness.closes.lock().is_empty());

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_change_replaces_session_once() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        controller.set_url(Some(OTHER_URL)).expect("valid url");
        settle().await;

        assert_eq!(harness.factory.session(0).close_calls(), 1);
        assert_eq!(
            harness.factory.urls(),
            vec![URL.to_string(), OTHER_URL.to_string()]
        );
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert!(harness.closes.lock().is_empty());

        controller.set_url(Some(OTHER_URL)).expect("valid url");
        settle().await;
        assert_eq!(harness.factory.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_url_rejects_wrong_scheme() {
        let harness = Harness::new();
        let controller = harness.spawn(ConnectionOptions::new(URL));

        let err = controller
            .set_url(Some("https://example.test/live"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_url_disconnects() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        controller.set_url(None).expect("none is valid");
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.session(0).close_calls(), 1);
        assert_eq!(harness.factory.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_close_is_immediate_and_final() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        controller.close();
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        settle().await;
        advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.session(0).close_calls(), 1);
        assert_eq!(harness.factory.opened(), 1);
        assert!(harness.closes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retry() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        harness.factory.last().drop_connection();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Reconnecting);

        controller.close();
        advance(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_closes_transport_and_unsubscribes() {
        let harness = Harness::new();
        let controller = harness
            .connected(ConnectionOptions::new(URL).with_ping_pong())
            .await;
        assert_eq!(harness.visibility.subscriber_count(), 1);

        drop(controller);
        settle().await;

        assert_eq!(harness.factory.session(0).close_calls(), 1);
        assert_eq!(harness.visibility.subscriber_count(), 0);

        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 1);
        assert_eq!(harness.factory.session(0).sent(), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_controller_stays_idle() {
        let harness = Harness::new();
        let controller = harness.spawn(ConnectionOptions::new(URL).with_enabled(false));
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.opened(), 0);
        assert_eq!(harness.visibility.subscriber_count(), 0);

        controller.set_enabled(true);
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(harness.visibility.subscriber_count(), 1);

        controller.set_enabled(false);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        settle().await;
        assert_eq!(harness.factory.session(0).close_calls(), 1);
        assert_eq!(harness.visibility.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_host_suspends_and_resumes() {
        let harness = Harness::new();
        let controller = harness.connected(ConnectionOptions::new(URL)).await;

        harness.visibility.set_visible(false);
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.session(0).close_calls(), 1);

        harness.visibility.set_visible(true);
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(harness.factory.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_suspended_when_hidden() {
        let harness = Harness::new();
        harness.visibility.set_visible(false);
        let controller = harness.spawn(ConnectionOptions::new(URL));
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(harness.factory.opened(), 0);

        harness.visibility.set_visible(true);
        settle().await;
        assert_eq!(harness.factory.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_when_hidden_ignores_visibility() {
        let harness = Harness::new();
        let controller = harness
            .connected(ConnectionOptions::new(URL).keep_alive_when_hidden())
            .await;

        harness.visibility.set_visible(false);
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(harness.factory.session(0).close_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_stop_driver() {
        let factory = MockFactory::default();
        let controller = ConnectionController::<Value>::builder()
            .url(URL)
            .factory(factory.clone())
            .visibility(VisibilityCoordinator::new())
            .on_message(|_| panic!("consumer bug"))
            .spawn()
            .expect("spawn");
        settle().await;

        factory.last().accept();
        settle().await;
        factory.last().deliver(r#"{"n":1}"#);
        settle().await;

        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(controller.send("still alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_observable() {
        let harness = Harness::new();
        let controller = harness.spawn(ConnectionOptions::new(URL));
        let mut changes = controller.state_changes();
        settle().await;

        harness.factory.last().accept();
        changes
            .wait_for(|status| status.state == ConnectionState::Connected)
            .await
            .expect("driver alive");
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let err = ConnectionController::<Value>::builder()
            .url(URL)
            .spawn()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_options() {
        let err = ConnectionController::<Value>::builder()
            .url("not a url")
            .spawn()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));

        let err = ConnectionController::<Value>::builder()
            .url(URL)
            .retry_delay_ms(0)
            .spawn()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_error_reconnects() {
        let harness = Harness::with_factory(MockFactory::event_stream());
        let controller = harness
            .connected(ConnectionOptions::new(SSE_URL).with_transport(TransportKind::EventStream))
            .await;
        assert_eq!(controller.transport(), TransportKind::EventStream);

        harness.factory.last().fail("Event stream ended");
        settle().await;

        let status = controller.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.error.as_deref(), Some("EventStream connection error"));
        assert_eq!(status.retry_count, 1);
        assert_eq!(harness.errors.lock().len(), 1);
        assert!(harness.closes.lock().is_empty());

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(harness.factory.opened(), 2);
        assert_eq!(
            harness.factory.urls(),
            vec![SSE_URL.to_string(), SSE_URL.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_send_is_refused() {
        let harness = Harness::with_factory(MockFactory::event_stream());
        let controller = harness
            .connected(ConnectionOptions::new(SSE_URL).with_transport(TransportKind::EventStream))
            .await;

        assert!(controller.is_connected());
        assert!(!controller.send("hello"));
        assert!(!controller.send_json(&json!({"type": "subscribe"})).expect("json"));
        assert!(harness.factory.last().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_retry_delay_does_not_stall_driver() {
        let harness = Harness::new();
        let controller = harness
            .connected(ConnectionOptions::new(URL).with_retry_delay_ms(u64::MAX))
            .await;

        harness.factory.last().drop_connection();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Reconnecting);
        assert_eq!(harness.factory.opened(), 1);

        controller.reconnect();
        settle().await;
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(harness.factory.opened(), 2);
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_retried_then_gives_up() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let closes: Arc<Mutex<Vec<CloseInfo>>> = Arc::default();
        let (error_log, close_log) = (Arc::clone(&errors), Arc::clone(&closes));
        let controller = ConnectionController::<Value>::builder()
            .url(format!("ws://{addr}/live"))
            .connect_timeout_ms(200)
            .max_retries(1)
            .retry_delay_ms(50)
            .visibility(VisibilityCoordinator::new())
            .on_error(move |e| error_log.lock().push(e.to_string()))
            .on_close(move |info| close_log.lock().push(info.clone()))
            .spawn()
            .expect("spawn controller");

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            controller.wait_for(ConnectionState::Error),
        )
        .await
        .expect("gave up within 5s");

        assert_eq!(status.error.as_deref(), Some(MAX_RETRIES_EXCEEDED));
        assert_eq!(status.retry_count, 1);
        assert_eq!(
            errors
                .lock()
                .iter()
                .filter(|e| e.ends_with("Connection timed out after 200ms"))
                .count(),
            2
        );
        assert!(closes.lock().is_empty());
    }
}
