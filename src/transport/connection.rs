//! Transport connection and event loop.
//!
//! A [`Connection`] wraps any [`FrameReader`]/[`FrameWriter`] pair and
//! handles request/response correlation and inbound message routing.
//!
//! # Event Loop
//!
//! The connection spawns two tokio tasks:
//!
//! - a reader task that pulls frames off the transport
//! - an event loop that owns the writer, routes inbound frames in arrival
//!   order and drains the outbound command queue
//!
//! Responses complete pending requests; requests and notifications go to
//! every handler registered with [`Connection::on_message`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SubscriptionId};
use crate::protocol::{Message, Request, Response, RpcError, codes};

use super::codec::Priority;
use super::correlation::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use super::frame::{FrameReader, FrameWriter};
use super::length_prefixed::{FramingOptions, LengthPrefixedReader, LengthPrefixedWriter};
use super::line::{LineReader, LineWriter};
use super::socket;

// ============================================================================
// Constants
// ============================================================================

/// Inbound frames buffered between the reader task and the event loop.
const INBOUND_QUEUE: usize = 256;

// ============================================================================
// Types
// ============================================================================

/// Inbound message callback.
///
/// Called on the event loop for each request and notification, in arrival
/// order. Handlers must not block; spawn for anything slow.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Registered handlers in subscription order.
type HandlerList = Vec<(SubscriptionId, MessageHandler)>;

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write a message.
    Send { message: Message, priority: Priority },
    /// Flush, close the writer and stop.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// One physical transport with correlation and routing.
///
/// Cloning is cheap; clones share the same event loop.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. [`send`](Self::send) never waits for the
/// transport; it only enqueues.
#[derive(Clone)]
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Pending requests (shared with event loop).
    correlator: Arc<Correlator>,
    /// Message handlers (shared with event loop).
    handlers: Arc<Mutex<HandlerList>>,
    /// Becomes `true` once the event loop has stopped.
    closed: watch::Receiver<bool>,
    /// Default timeout of [`request`](Self::request).
    request_timeout: Duration,
    /// Transport name used in logs.
    label: &'static str,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.label)
            .field("pending", &self.correlator.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection - Constructors
// ============================================================================

impl Connection {
    /// Creates a connection over an arbitrary frame transport.
    ///
    /// Spawns the reader task and event loop internally.
    pub fn new<R, W>(label: &'static str, reader: R, writer: W) -> Self
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let (connection, startup) = Self::deferred(label, reader, writer);
        startup.start();
        connection
    }

    /// Creates a connection whose tasks run only once [`Startup::start`]
    /// is called.
    ///
    /// Handlers registered before starting see every inbound message.
    /// Messages sent before starting are queued.
    pub fn deferred<R, W>(label: &'static str, reader: R, writer: W) -> (Self, Startup)
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (closed_tx, closed) = watch::channel(false);
        let correlator = Arc::new(Correlator::new());
        let handlers: Arc<Mutex<HandlerList>> = Arc::new(Mutex::new(Vec::new()));

        let state = EventLoop {
            outbox: Outbox::new(writer),
            inbound_rx,
            command_rx,
            correlator: Arc::clone(&correlator),
            handlers: Arc::clone(&handlers),
            closed_tx,
            label,
        };

        let run = async move {
            let reader_task = Self::spawn_reader(reader, inbound_tx, label);
            debug!(transport = label, "Connection started");
            Self::run_event_loop(state, reader_task).await;
        };

        let connection = Self {
            command_tx,
            correlator,
            handlers,
            closed,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            label,
        };

        (connection, Startup(Box::pin(run)))
    }

    /// Creates a newline-delimited JSON connection.
    pub fn line<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new("line", LineReader::new(read), LineWriter::new(write))
    }

    /// Creates a length-prefixed connection.
    pub fn length_prefixed<R, W>(read: R, write: W, options: FramingOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            "length-prefixed",
            LengthPrefixedReader::new(read),
            LengthPrefixedWriter::new(write, options),
        )
    }

    /// Creates a connection over an established WebSocket.
    pub fn websocket<S>(stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = socket::split(stream);
        Self::new("websocket", reader, writer)
    }

    /// Like [`websocket`](Self::websocket), started by the caller.
    pub fn websocket_deferred<S>(stream: WebSocketStream<S>) -> (Self, Startup)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = socket::split(stream);
        Self::deferred("websocket", reader, writer)
    }

    /// Sets the default timeout of [`request`](Self::request).
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Returns the timeout used by [`request`](Self::request).
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Tasks of a connection created with [`Connection::deferred`].
#[must_use = "the connection does nothing until started"]
pub struct Startup(Pin<Box<dyn Future<Output = ()> + Send>>);

impl fmt::Debug for Startup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Startup").finish_non_exhaustive()
    }
}

impl Startup {
    /// Spawns the reader task and event loop.
    pub fn start(self) {
        tokio::spawn(self.0);
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Registers an inbound request/notification handler.
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        before != handlers.len()
    }

    /// Queues a message with normal priority.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the event loop has stopped.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.send_with_priority(message, Priority::Normal)
    }

    /// Queues a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the event loop has stopped.
    pub fn send_with_priority(&self, message: impl Into<Message>, priority: Priority) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::Send {
                message: message.into(),
                priority,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Returns a fresh request id unique on this connection.
    #[inline]
    pub fn next_request_id(&self) -> RequestId {
        self.correlator.next_id()
    }

    /// Sends a request with a generated id and returns its result.
    ///
    /// Uses the connection's default timeout.
    ///
    /// # Errors
    ///
    /// See [`send_and_await`](Self::send_and_await); an error response
    /// becomes [`Error::Remote`].
    pub async fn request(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        let (request_id, response_rx) = self.correlator.register_next()?;
        let request = Request::new(request_id, method, params);
        self.transmit_and_wait(request, response_rx, self.request_timeout)
            .await?
            .into_result()
    }

    /// Sends `request` and waits for the response with the same id.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateRequestId`] if the id is already pending
    /// - [`Error::Protocol`] if too many requests are pending
    /// - [`Error::ConnectionClosed`] if the transport closes first
    /// - [`Error::RequestTimeout`] if nothing arrives within `request_timeout`
    pub async fn send_and_await(&self, request: Request, request_timeout: Duration) -> Result<Response> {
        let response_rx = self.correlator.register(request.id.clone())?;
        self.transmit_and_wait(request, response_rx, request_timeout)
            .await
    }

    /// Queues an already registered request and waits for its outcome.
    async fn transmit_and_wait(
        &self,
        request: Request,
        response_rx: oneshot::Receiver<Result<Response>>,
        request_timeout: Duration,
    ) -> Result<Response> {
        let request_id = request.id.clone();

        if self.is_closed()
            || self
                .command_tx
                .send(ConnectionCommand::Send {
                    message: request.into(),
                    priority: Priority::Immediate,
                })
                .is_err()
        {
            self.correlator.remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        trace!(transport = self.label, %request_id, "Request queued");

        match timeout(request_timeout, response_rx).await {
            Ok(received) => received?,
            Err(_) => {
                self.correlator.remove(&request_id);
                Err(Error::request_timeout(
                    request_id,
                    u64::try_from(request_timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Returns the number of pending requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Returns `true` once the event loop has stopped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits until the event loop has stopped.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // Sender dropped also means stopped.
        let _ = closed.wait_for(|c| *c).await;
    }

    /// Flushes, closes the transport and stops the event loop.
    ///
    /// Not called on drop; clones share the loop.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }
}

// ============================================================================
// Connection - Event Loop
// ============================================================================

/// State owned by the event loop task.
struct EventLoop<W> {
    outbox: Outbox<W>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    correlator: Arc<Correlator>,
    handlers: Arc<Mutex<HandlerList>>,
    closed_tx: watch::Sender<bool>,
    label: &'static str,
}

impl Connection {
    /// Pulls frames off the transport until it ends or fails.
    fn spawn_reader<R: FrameReader>(
        mut reader: R,
        inbound_tx: mpsc::Sender<Vec<u8>>,
        label: &'static str,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(transport = label, "Transport reached end of stream");
                        break;
                    }
                    Err(e) => {
                        error!(transport = label, error = %e, "Transport read failed");
                        break;
                    }
                }
            }
        })
    }

    /// Event loop that owns the writer.
    async fn run_event_loop<W: FrameWriter>(mut state: EventLoop<W>, reader_task: JoinHandle<()>) {
        let label = state.label;

        loop {
            let flush_at = state.outbox.flush_at;

            tokio::select! {
                // Frames from the reader task
                frame = state.inbound_rx.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };

                    let reply = Self::handle_incoming_frame(
                        &frame,
                        &state.correlator,
                        &state.handlers,
                        label,
                    );

                    if let Some(reply) = reply
                        && let Err(e) = state.outbox.write(&reply, Priority::Normal).await
                    {
                        error!(transport = label, error = %e, "Failed to write reply");
                        break;
                    }
                }

                // Commands from the public API
                command = state.command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send { message, priority }) => {
                            if let Err(e) = state.outbox.write(&message, priority).await {
                                error!(transport = label, error = %e, "Failed to write message");
                                break;
                            }
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!(transport = label, "Shutdown command received");
                            if let Err(e) = state.outbox.writer.close().await {
                                warn!(transport = label, error = %e, "Close failed");
                            }
                            break;
                        }

                        None => {
                            debug!(transport = label, "Command channel closed");
                            break;
                        }
                    }
                }

                // Coalescing window elapsed
                () = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    if let Err(e) = state.outbox.flush().await {
                        error!(transport = label, error = %e, "Flush failed");
                        break;
                    }
                }
            }
        }

        if state.outbox.flush_at.is_some()
            && let Err(e) = state.outbox.flush().await
        {
            trace!(transport = label, error = %e, "Final flush failed");
        }

        // Mark closed before failing pending requests so late registrations see it.
        state.closed_tx.send_replace(true);
        reader_task.abort();
        state.correlator.fail_all();

        debug!(transport = label, "Event loop terminated");
    }

    /// Routes one inbound frame. Returns a reply to write, if any.
    fn handle_incoming_frame(
        frame: &[u8],
        correlator: &Correlator,
        handlers: &Mutex<HandlerList>,
        label: &'static str,
    ) -> Option<Message> {
        let value: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(e) => {
                warn!(transport = label, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        let raw_id = value.get("id").cloned();
        let has_method = value.get("method").is_some();

        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                // An identifiable request still gets an answer.
                let id = raw_id.and_then(|raw| serde_json::from_value::<RequestId>(raw).ok());
                if has_method && let Some(id) = id {
                    debug!(transport = label, %id, error = %e, "Rejecting invalid request");
                    return Some(Message::Response(Response::error(
                        Some(id),
                        RpcError::new(codes::INVALID_REQUEST, e.to_string()),
                    )));
                }
                warn!(transport = label, error = %e, "Dropping invalid message");
                return None;
            }
        };

        if let Message::Response(response) = message {
            let id = response.id.clone();
            if !correlator.resolve(response) {
                trace!(transport = label, ?id, "Dropping response for unknown or expired request");
            }
            return None;
        }

        let targets: Vec<(SubscriptionId, MessageHandler)> = handlers.lock().clone();
        if targets.is_empty() {
            trace!(transport = label, method = ?message.method(), "No handler for inbound message");
        }

        for (id, handler) in &targets {
            if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                error!(transport = label, subscription = %id, "Message handler panicked");
            }
        }

        None
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// Writer plus coalescing deadline.
struct Outbox<W> {
    writer: W,
    window: Duration,
    flush_at: Option<Instant>,
}

impl<W: FrameWriter> Outbox<W> {
    fn new(writer: W) -> Self {
        Self {
            window: writer.coalesce_window(),
            writer,
            flush_at: None,
        }
    }

    /// Writes one message and flushes now or arms the coalescing deadline.
    async fn write(&mut self, message: &Message, priority: Priority) -> Result<()> {
        let bytes = message.to_vec()?;
        self.writer.write_frame(&bytes).await?;
        trace!(kind = message.kind(), len = bytes.len(), ?priority, "Frame queued");

        if priority == Priority::Immediate || self.window.is_zero() {
            self.flush().await
        } else {
            if self.flush_at.is_none() {
                self.flush_at = Some(Instant::now() + self.window);
            }
            Ok(())
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_at = None;
        self.writer.flush().await
    }
}

// ============================================================================
// Tests
// ============================================================================
