//! WebSocket server for extension-side peers.
//!
//! Every accepted WebSocket becomes a [`Connection`] keyed by [`PeerId`].
//! The same port answers `GET /health` with a JSON status document so
//! launchers can probe liveness without upgrading.
//!
//! # Connection Flow
//!
//! 1. [`SocketServer::bind`] binds and starts the accept loop
//! 2. A peer connects; the first bytes are peeked
//! 3. `GET /health` gets a plain HTTP answer and is closed
//! 4. Anything else is upgraded to WebSocket and registered as a peer
//! 5. The peer handler is invoked before the peer's first message is read
//! 6. The peer is removed when it closes

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::identifiers::PeerId;
use crate::protocol::Message;

use super::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Request line prefix of a health probe.
const HEALTH_PREFIX: &[u8] = b"GET /health";

/// Time allowed for the first bytes and the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept poll interval used to observe shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Upper bound on health probe request headers.
const MAX_PROBE_HEADER: usize = 8 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Called once for every new peer, before any of its messages are routed.
pub type PeerHandler = Arc<dyn Fn(PeerId, &Connection) + Send + Sync>;

// ============================================================================
// SocketServer
// ============================================================================

/// Multi-peer WebSocket server.
///
/// Thread-safe; the accept loop runs on its own task.
pub struct SocketServer {
    /// Bound address.
    local_addr: SocketAddr,
    /// Name reported by the health probe.
    name: String,
    /// Active peers.
    peers: RwLock<FxHashMap<PeerId, Connection>>,
    /// New-peer callback.
    peer_handler: Mutex<Option<PeerHandler>>,
    /// Event sink.
    events: EventBus,
    /// Request timeout applied to peer connections.
    request_timeout: Duration,
    /// Shutdown flag.
    shutdown: AtomicBool,
}

impl fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.read().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SocketServer - Constructor
// ============================================================================

impl SocketServer {
    /// Binds to `addr` and starts the accept loop.
    ///
    /// Use port 0 to let the OS assign a random available port. Peer
    /// connections use `request_timeout` for their own requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(
        addr: SocketAddr,
        name: impl Into<String>,
        events: EventBus,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            name: name.into(),
            peers: RwLock::new(FxHashMap::default()),
            peer_handler: Mutex::new(None),
            events,
            request_timeout,
            shutdown: AtomicBool::new(false),
        });

        // Spawn accept loop
        let server_clone = Arc::clone(&server);
        tokio::spawn(async move {
            server_clone.accept_loop(listener).await;
        });

        info!(port = local_addr.port(), "Socket server started");

        Ok(server)
    }
}

// ============================================================================
// SocketServer - Public API
// ============================================================================

impl SocketServer {
    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL of this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Sets the callback run for every new peer.
    pub fn on_peer<F>(&self, handler: F)
    where
        F: Fn(PeerId, &Connection) + Send + Sync + 'static,
    {
        *self.peer_handler.lock() = Some(Arc::new(handler));
    }

    /// Returns the number of connected peers.
    #[inline]
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns connected peer ids in connection order.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns the connection of a peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerNotFound`] if the peer is not connected.
    pub fn peer(&self, peer_id: PeerId) -> Result<Connection> {
        self.peers
            .read()
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| Error::peer_not_found(peer_id))
    }

    /// Sends `message` to every peer. Returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let peers: Vec<Connection> = self.peers.read().values().cloned().collect();
        peers
            .iter()
            .filter(|c| c.send(message.clone()).is_ok())
            .count()
    }

    /// Closes one peer.
    pub fn disconnect_peer(&self, peer_id: PeerId) -> bool {
        let removed = self.peers.write().remove(&peer_id);
        match removed {
            Some(connection) => {
                connection.shutdown();
                debug!(peer_id = %peer_id, "Peer disconnected by server");
                true
            }
            None => false,
        }
    }

    /// Stops accepting and closes every peer.
    pub fn shutdown(&self) {
        info!(port = self.port(), "Socket server shutting down");

        self.shutdown.store(true, Ordering::SeqCst);

        let peers: Vec<_> = self.peers.write().drain().collect();
        for (peer_id, connection) in peers {
            connection.shutdown();
            debug!(peer_id = %peer_id, "Peer closed during shutdown");
        }
    }
}

// ============================================================================
// SocketServer - Accept Loop
// ============================================================================

impl SocketServer {
    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Handles a single incoming TCP connection.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        trace!(?addr, "New TCP connection");

        let is_probe = timeout(HANDSHAKE_TIMEOUT, is_health_probe(&stream))
            .await
            .map_err(|_| Error::connection_timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))??;

        if is_probe {
            return self.answer_health_probe(stream).await;
        }

        let ws_stream = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| Error::connection_timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let peer_id = PeerId::next();
        let (connection, startup) = Connection::websocket_deferred(ws_stream);
        let connection = connection.with_request_timeout(self.request_timeout);

        let handler = self.peer_handler.lock().clone();
        if let Some(handler) = handler {
            handler(peer_id, &connection);
        }

        self.peers.write().insert(peer_id, connection.clone());
        startup.start();
        info!(peer_id = %peer_id, ?addr, "Peer connected");
        self.events.emit(&BridgeEvent::PeerConnected { peer_id });

        connection.closed().await;

        self.peers.write().remove(&peer_id);
        info!(peer_id = %peer_id, "Peer disconnected");
        self.events.emit(&BridgeEvent::PeerDisconnected { peer_id });

        Ok(())
    }

    /// Writes the health document and closes.
    async fn answer_health_probe(&self, mut stream: TcpStream) -> Result<()> {
        // Drain the request head so the peer does not see a reset.
        let mut head = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_PROBE_HEADER {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&chunk[..n]);
        }

        let body = json!({
            "status": "ok",
            "server": self.name,
            "port": self.port(),
            "timestamp": SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        })
        .to_string();

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        debug!("Answered health probe");
        Ok(())
    }
}

/// Peeks until the request line is known to be, or not be, a health probe.
async fn is_health_probe(stream: &TcpStream) -> Result<bool> {
    let mut buf = [0u8; HEALTH_PREFIX.len()];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 || !HEALTH_PREFIX.starts_with(&buf[..n]) {
            return Ok(false);
        }
        if n == HEALTH_PREFIX.len() {
            return Ok(true);
        }
        // Prefix matches so far; wait for more bytes.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::events::EventKind;
    use crate::protocol::Response;
    use crate::transport::reconnect::{Connector, WsConnector};

    async fn bind() -> Arc<SocketServer> {
        SocketServer::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            "browser-bridge",
            EventBus::new(),
            Duration::from_secs(7),
        )
        .await
        .expect("bind should succeed")
    }

    #[tokio::test]
    async fn test_server_bind_random_port() {
        let server = bind().await;
        assert!(server.port() > 0);
        assert!(server.ws_url().starts_with("ws://127.0.0.1:"));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_health_probe() {
        let server = bind().await;

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("write");

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.expect("read");

        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        let body = raw.split("\r\n\r\n").nth(1).expect("body");
        let doc: Value = serde_json::from_str(body).expect("json");
        assert_eq!(doc["status"], "ok");
        assert_eq!(doc["server"], "browser-bridge");
        assert_eq!(doc["port"], server.port());
        assert!(doc["timestamp"].as_u64().is_some());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_configured_request_timeout_reaches_both_ends() {
        let server = bind().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.on_peer(move |_, connection| {
            let _ = tx.send(connection.request_timeout());
        });

        let client = WsConnector::new(server.ws_url())
            .with_request_timeout(Duration::from_secs(3))
            .connect()
            .await
            .expect("connect");
        assert_eq!(client.request_timeout(), Duration::from_secs(3));

        let peer_timeout = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("peer accepted")
            .expect("timeout sent");
        assert_eq!(peer_timeout, Duration::from_secs(7));

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_peer_lifecycle_and_routing() {
        let server = bind().await;
        let events = server.events.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        events.on(EventKind::PeerDisconnected, move |event| {
            let _ = tx.send(event.clone());
        });

        server.on_peer(|_, connection| {
            let responder = connection.clone();
            connection.on_message(move |message| {
                if let Message::Request(request) = message {
                    let _ = responder.send(Response::success(
                        request.id.clone(),
                        Value::String(request.method.clone()),
                    ));
                }
            });
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url())
            .await
            .expect("connect");
        ws.send(WsMessage::Text(
            r#"{"jsonrpc":"2.0","id":1,"method":"echo"}"#.into(),
        ))
        .await
        .expect("send");

        let reply = loop {
            match ws.next().await.expect("open").expect("frame") {
                WsMessage::Text(text) => break text.as_str().to_string(),
                _ => continue,
            }
        };
        let reply: Value = serde_json::from_str(&reply).expect("json");
        assert_eq!(reply["result"], "echo");
        assert_eq!(server.peer_count(), 1);

        ws.close(None).await.expect("close");
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("disconnect event")
            .expect("event");
        assert!(matches!(event, BridgeEvent::PeerDisconnected { .. }));
        assert_eq!(server.peer_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let server = bind().await;
        assert!(server.peer(PeerId::next()).unwrap_err().is_not_found());
        assert!(!server.disconnect_peer(PeerId::next()));
        server.shutdown();
    }
}
