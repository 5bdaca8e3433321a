//! Reconnecting client.
//!
//! [`ReconnectMachine`] is the pure state machine; [`ReconnectingClient`]
//! drives it with a [`Connector`] on a single supervising task.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │                  │
//!      │◄────────error────────────┘◄──────close──────┘
//!      │
//!      └── after delay: Connecting again, unless disconnect() was called
//!          or the attempt limit is reached (then ReconnectFailed)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::identifiers::SubscriptionId;
use crate::protocol::{Message, Notification};

use super::connection::{Connection, MessageHandler};
use super::correlation::DEFAULT_REQUEST_TIMEOUT;
use super::length_prefixed::duration_ms;

// ============================================================================
// Constants
// ============================================================================

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Default timeout of a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Method of the notification sent after every successful connect.
pub const HELLO_METHOD: &str = "bridge/hello";

// ============================================================================
// ConnectionState
// ============================================================================

/// Observable state of a reconnecting client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport and no attempt in progress.
    #[default]
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// The transport is up.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Backoff {
    /// Same delay every time.
    #[default]
    Fixed,
    /// Doubles per attempt up to `max_delay`.
    Exponential {
        /// Upper bound of the delay.
        #[serde(with = "duration_ms", rename = "maxDelayMs")]
        max_delay: Duration,
    },
}

/// When and how often to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Base delay.
    #[serde(with = "duration_ms", rename = "delayMs")]
    pub delay: Duration,
    /// Delay growth.
    #[serde(default)]
    pub backoff: Backoff,
    /// Attempts before giving up; `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            backoff: Backoff::Fixed,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor).min(max_delay)
            }
        }
    }
}

// ============================================================================
// ReconnectMachine
// ============================================================================

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Start a connect attempt now.
    Connect,
    /// Wait, then report [`ReconnectMachine::on_timer_fired`].
    Schedule(Duration),
    /// Stop; the attempt limit was reached.
    GiveUp {
        /// Attempts made.
        attempts: u32,
    },
    /// Nothing to do.
    Idle,
}

/// Pure reconnection state machine.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    timer_armed: bool,
    suppressed: bool,
    exhausted: bool,
}

impl ReconnectMachine {
    /// Creates a machine in `Disconnected`.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            timer_armed: false,
            suppressed: false,
            exhausted: false,
        }
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last successful connect.
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the attempt count if the machine gave up.
    #[inline]
    #[must_use]
    pub fn exhausted(&self) -> Option<u32> {
        self.exhausted.then_some(self.attempts)
    }

    /// Returns `true` while a reconnect delay is pending.
    #[inline]
    #[must_use]
    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    /// User asked to connect. Starts a fresh attempt budget.
    pub fn start(&mut self) -> ReconnectAction {
        self.suppressed = false;
        if self.state != ConnectionState::Disconnected || self.timer_armed {
            return ReconnectAction::Idle;
        }
        self.state = ConnectionState::Connecting;
        self.attempts = 0;
        self.exhausted = false;
        ReconnectAction::Connect
    }

    /// The transport came up.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.timer_armed = false;
    }

    /// The transport closed or a connect attempt failed.
    pub fn on_closed(&mut self) -> ReconnectAction {
        self.state = ConnectionState::Disconnected;

        if self.suppressed || self.timer_armed {
            return ReconnectAction::Idle;
        }

        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            self.exhausted = true;
            return ReconnectAction::GiveUp {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        self.timer_armed = true;
        ReconnectAction::Schedule(self.policy.delay_for(self.attempts))
    }

    /// The reconnect delay elapsed.
    pub fn on_timer_fired(&mut self) -> ReconnectAction {
        if !self.timer_armed {
            return ReconnectAction::Idle;
        }
        self.timer_armed = false;

        if self.suppressed {
            return ReconnectAction::Idle;
        }
        self.state = ConnectionState::Connecting;
        ReconnectAction::Connect
    }

    /// User asked to disconnect: cancel the timer, stop rescheduling.
    pub fn disconnect(&mut self) {
        self.suppressed = true;
        self.timer_armed = false;
        self.state = ConnectionState::Disconnected;
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens a fresh transport connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes one connection.
    async fn connect(&self) -> Result<Connection>;
}

/// Connects to a WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for `url` (`ws://host:port/path`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the per-attempt timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the request timeout of each established connection.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        let (stream, _response) = timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| {
            Error::connection_timeout(
                u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            )
        })??;

        debug!(url = %self.url, "WebSocket connected");
        Ok(Connection::websocket(stream).with_request_timeout(self.request_timeout))
    }
}

// ============================================================================
// ReconnectingClient
// ============================================================================

/// Shared state of a [`ReconnectingClient`].
struct ClientInner {
    connector: Arc<dyn Connector>,
    machine: Mutex<ReconnectMachine>,
    current: Mutex<Option<Connection>>,
    handlers: Mutex<Vec<(SubscriptionId, MessageHandler)>>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
    client_id: String,
    version: String,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// A client connection that re-establishes itself after loss.
///
/// Message handlers are registered on the client, not on a transport, and
/// therefore survive reconnects.
#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReconnectingClient {
    /// Creates a disconnected client.
    pub fn new(connector: impl Connector, policy: ReconnectPolicy, events: EventBus) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                connector: Arc::new(connector),
                machine: Mutex::new(ReconnectMachine::new(policy)),
                current: Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                state_tx,
                events,
                client_id: uuid::Uuid::new_v4().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Returns the id sent in the handshake.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns the live transport, if connected.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.inner.current.lock().clone()
    }

    /// Registers a persistent message handler.
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a persistent handler.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        before != handlers.len()
    }

    /// Sends on the live transport.
    ///
    /// # Errors
    ///
    /// - [`Error::ReconnectExhausted`] once the client has given up
    /// - [`Error::ConnectionClosed`] while otherwise not connected
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.live()?.send(message)
    }

    /// Sends a request on the live transport and awaits its result.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send) while not connected, otherwise see
    /// [`Connection::request`].
    pub async fn request(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.live()?.request(method, params).await
    }

    fn live(&self) -> Result<Connection> {
        if let Some(connection) = self.connection() {
            return Ok(connection);
        }
        match self.inner.machine.lock().exhausted() {
            Some(attempts) => Err(Error::ReconnectExhausted { attempts }),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Starts connecting. No-op while already running.
    pub fn connect(&self) {
        if self.inner.machine.lock().start() != ReconnectAction::Connect {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(Self::drive(inner));
        if let Some(previous) = self.inner.driver.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Closes the transport and stops reconnecting.
    pub fn disconnect(&self) {
        self.inner.machine.lock().disconnect();

        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
        if let Some(connection) = self.inner.current.lock().take() {
            connection.shutdown();
        }

        Self::set_state(&self.inner, ConnectionState::Disconnected);
        info!(client_id = %self.inner.client_id, "Client disconnected");
    }

    /// Supervising task: one attempt or one delay at a time.
    async fn drive(inner: Arc<ClientInner>) {
        loop {
            Self::set_state(&inner, ConnectionState::Connecting);

            let action = match inner.connector.connect().await {
                Ok(connection) => {
                    Self::attach(&inner, &connection);
                    connection.closed().await;
                    inner.current.lock().take();
                    info!(client_id = %inner.client_id, "Connection lost");
                    inner.machine.lock().on_closed()
                }
                Err(e) => {
                    warn!(client_id = %inner.client_id, error = %e, "Connect attempt failed");
                    inner.machine.lock().on_closed()
                }
            };

            Self::set_state(&inner, ConnectionState::Disconnected);

            match action {
                ReconnectAction::Schedule(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                    tokio::time::sleep(delay).await;
                    if inner.machine.lock().on_timer_fired() != ReconnectAction::Connect {
                        break;
                    }
                }
                ReconnectAction::GiveUp { attempts } => {
                    warn!(client_id = %inner.client_id, attempts, "Reconnect gave up");
                    inner.events.emit(&BridgeEvent::ReconnectFailed { attempts });
                    break;
                }
                ReconnectAction::Connect | ReconnectAction::Idle => break,
            }
        }
    }

    /// Wires a fresh transport: state, persistent handlers, handshake.
    fn attach(inner: &Arc<ClientInner>, connection: &Connection) {
        inner.machine.lock().on_connected();

        let weak = Arc::downgrade(inner);
        connection.on_message(move |message| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handlers: Vec<MessageHandler> =
                inner.handlers.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
            for handler in handlers {
                handler(message);
            }
        });

        *inner.current.lock() = Some(connection.clone());
        Self::set_state(inner, ConnectionState::Connected);
        info!(client_id = %inner.client_id, "Client connected");

        let hello = Notification::new(
            HELLO_METHOD,
            Some(json!({"clientId": inner.client_id, "version": inner.version})),
        );
        if let Err(e) = connection.send(hello) {
            warn!(error = %e, "Failed to send handshake");
        }
    }

    fn set_state(inner: &ClientInner, state: ConnectionState) {
        let changed = inner.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            debug!(client_id = %inner.client_id, %state, "Connection state changed");
            inner.events.emit(&BridgeEvent::ConnectionStateChanged { state });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::events::EventKind;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(10),
            backoff: Backoff::Fixed,
            max_attempts,
        }
    }

    struct FailingConnector {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self) -> Result<Connection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::connection("refused"))
        }
    }

    #[test]
    fn test_machine_gives_up_after_max() {
        let mut machine = ReconnectMachine::new(policy(Some(2)));

        assert_eq!(machine.start(), ReconnectAction::Connect);
        assert!(matches!(machine.on_closed(), ReconnectAction::Schedule(_)));
        assert_eq!(machine.on_timer_fired(), ReconnectAction::Connect);
        assert!(matches!(machine.on_closed(), ReconnectAction::Schedule(_)));
        assert_eq!(machine.on_timer_fired(), ReconnectAction::Connect);
        assert_eq!(machine.on_closed(), ReconnectAction::GiveUp { attempts: 2 });
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        assert_eq!(machine.exhausted(), Some(2));

        assert_eq!(machine.start(), ReconnectAction::Connect);
        assert_eq!(machine.attempts(), 0);
        assert_eq!(machine.exhausted(), None);
    }

    #[test]
    fn test_machine_single_timer() {
        let mut machine = ReconnectMachine::new(policy(None));
        machine.start();

        assert!(matches!(machine.on_closed(), ReconnectAction::Schedule(_)));
        assert_eq!(machine.on_closed(), ReconnectAction::Idle);
        assert_eq!(machine.attempts(), 1);
        assert_eq!(machine.start(), ReconnectAction::Idle);
    }

    #[test]
    fn test_machine_connected_resets_attempts() {
        let mut machine = ReconnectMachine::new(policy(Some(5)));
        machine.start();
        machine.on_closed();
        machine.on_timer_fired();
        machine.on_connected();

        assert_eq!(machine.attempts(), 0);
        assert!(!machine.timer_armed());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_machine_disconnect_suppresses() {
        let mut machine = ReconnectMachine::new(policy(None));
        machine.start();
        machine.on_closed();

        machine.disconnect();
        assert_eq!(machine.on_timer_fired(), ReconnectAction::Idle);
        assert_eq!(machine.on_closed(), ReconnectAction::Idle);
        assert_eq!(machine.start(), ReconnectAction::Connect);
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(100),
            backoff: Backoff::Exponential {
                max_delay: Duration::from_millis(500),
            },
            max_attempts: None,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_client_halts_after_max_attempts() {
        let events = EventBus::new();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        events.once(EventKind::ReconnectFailed, move |event| {
            if let BridgeEvent::ReconnectFailed { attempts } = event
                && let Some(tx) = tx.lock().take()
            {
                let _ = tx.send(*attempts);
            }
        });

        let calls = Arc::new(AtomicU32::new(0));
        let client = ReconnectingClient::new(
            FailingConnector {
                calls: Arc::clone(&calls),
            },
            policy(Some(2)),
            events,
        );
        client.connect();

        let attempts = timeout(Duration::from_secs(2), rx)
            .await
            .expect("gave up in time")
            .expect("event");
        assert_eq!(attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let err = client.request("ping", None).await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_handlers_survive_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));

        tokio::spawn(async move {
            // First peer: read the hello, then drop the socket.
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            let _hello = ws.next().await;
            drop(ws);

            // Second peer: read the hello, then push a notification.
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            let _hello = ws.next().await;
            let push = r#"{"jsonrpc":"2.0","method":"tab/updated","params":{"tabId":1}}"#;
            ws.send(WsMessage::Text(push.into())).await.expect("send");
            let _ = ws.next().await;
        });

        let client = ReconnectingClient::new(WsConnector::new(url), policy(None), EventBus::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.on_message(move |message| {
            let _ = tx.send(message.method().map(str::to_string));
        });
        client.connect();

        let method = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivered")
            .flatten();
        assert_eq!(method.as_deref(), Some("tab/updated"));

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
