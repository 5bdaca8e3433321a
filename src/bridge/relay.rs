//! Native messaging host relay.
//!
//! The browser starts the host with length-prefixed JSON on stdin/stdout.
//! The relay forwards that traffic to the bridge's socket server over a
//! [`ReconnectingClient`], so either side can restart without the other
//! noticing more than a failed request.
//!
//! ```text
//! Extension ──length-prefixed──► Relay ──WebSocket──► Bridge socket server
//! ```
//!
//! Requests are re-issued on the far side and answered with the original
//! id; notifications are forwarded as is.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tracing::{debug, info, trace};

use crate::config::BridgeConfig;
use crate::error::Error;
use crate::events::EventBus;
use crate::identifiers::SubscriptionId;
use crate::protocol::{Message, Request, Response};
use crate::transport::{
    Connection, LengthPrefixedReader, LengthPrefixedWriter, ReconnectingClient, WsConnector,
};

// ============================================================================
// NativeRelay
// ============================================================================

/// Pairs a native messaging connection with a reconnecting socket client.
pub struct NativeRelay {
    native: Connection,
    upstream: ReconnectingClient,
    subscriptions: (SubscriptionId, SubscriptionId),
}

impl fmt::Debug for NativeRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRelay")
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

impl NativeRelay {
    /// Relays between the given native stream and `upstream`.
    ///
    /// `upstream` is connected by this call.
    pub fn new<R, W>(read: R, write: W, upstream: ReconnectingClient, config: &BridgeConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (native, startup) = Connection::deferred(
            "length-prefixed",
            LengthPrefixedReader::new(read),
            LengthPrefixedWriter::new(write, config.framing),
        );
        let native = native.with_request_timeout(config.request_timeout);

        let to_upstream = {
            let from = Side::Native(native.clone());
            let to = Side::Upstream(upstream.clone());
            native.on_message(move |message| forward(message, &from, &to))
        };

        let to_native = {
            let from = Side::Upstream(upstream.clone());
            let to = Side::Native(native.clone());
            upstream.on_message(move |message| forward(message, &from, &to))
        };

        startup.start();
        upstream.connect();

        Self {
            native,
            upstream,
            subscriptions: (to_upstream, to_native),
        }
    }

    /// Relays stdin/stdout to the socket server named by `config`.
    #[must_use]
    pub fn stdio(config: &BridgeConfig, events: EventBus) -> Self {
        let upstream = ReconnectingClient::new(
            WsConnector::new(config.socket_url()).with_request_timeout(config.request_timeout),
            config.reconnect,
            events,
        );
        Self::new(stdin(), stdout(), upstream, config)
    }

    /// Returns the upstream client.
    #[inline]
    #[must_use]
    pub fn upstream(&self) -> &ReconnectingClient {
        &self.upstream
    }

    /// Waits until the native side closes, then stops the upstream.
    pub async fn run(self) {
        info!(client_id = %self.upstream.client_id(), "Native relay running");
        self.native.closed().await;
        self.shutdown();
    }

    /// Stops both sides.
    pub fn shutdown(&self) {
        self.native.off(self.subscriptions.0);
        self.upstream.off(self.subscriptions.1);
        self.upstream.disconnect();
        self.native.shutdown();
        info!("Native relay stopped");
    }
}

// ============================================================================
// Forwarding
// ============================================================================

/// One end of the relay.
#[derive(Clone)]
enum Side {
    Upstream(ReconnectingClient),
    Native(Connection),
}

impl Side {
    fn send(&self, message: Message) -> crate::Result<()> {
        match self {
            Self::Upstream(client) => client.send(message),
            Self::Native(connection) => connection.send(message),
        }
    }

    async fn request(&self, request: Request) -> crate::Result<serde_json::Value> {
        match self {
            Self::Upstream(client) => client.request(request.method, request.params).await,
            Self::Native(connection) => connection.request(request.method, request.params).await,
        }
    }
}

/// Forwards one message from `from` to `to`; requests are answered on `from`.
fn forward(message: &Message, from: &Side, to: &Side) {
    match message {
        Message::Notification(notification) => {
            trace!(method = %notification.method, "Relaying notification");
            if let Err(e) = to.send(Message::Notification(notification.clone())) {
                debug!(method = %notification.method, error = %e, "Notification dropped");
            }
        }
        Message::Request(request) => {
            let request = request.clone();
            let from = from.clone();
            let to = to.clone();
            tokio::spawn(async move {
                let id = request.id.clone();
                trace!(%id, method = %request.method, "Relaying request");
                let response = match to.request(request).await {
                    Ok(result) => Response::success(id, result),
                    Err(e) => {
                        debug!(%id, error = %e, "Relayed request failed");
                        Response::from_error(id, &relay_error(e))
                    }
                };
                if let Err(e) = from.send(response.into()) {
                    debug!(error = %e, "Relay response dropped");
                }
            });
        }
        Message::Response(_) => {}
    }
}

/// Keeps remote error codes; everything else becomes a connection error.
fn relay_error(e: Error) -> Error {
    match e {
        Error::Remote { .. } => e,
        other if other.is_connection_error() => other,
        other => Error::connection(other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{duplex, split};

    use crate::bridge::Bridge;
    use crate::protocol::codes;
    use crate::session::PortRange;
    use crate::transport::{ConnectionState, FramingOptions};

    #[tokio::test]
    async fn test_requests_relayed_to_bridge() {
        let bridge = Bridge::builder()
            .config(
                BridgeConfig::default()
                    .with_port_ranges(PortRange::new(45100, 45109), PortRange::new(45200, 45209))
                    .with_socket_port(0),
            )
            .build()
            .expect("build");
        let server = bridge.start_socket_server().await.expect("bind");

        let config = bridge.config().clone().with_socket_port(server.port());
        let upstream = ReconnectingClient::new(
            WsConnector::new(config.socket_url()),
            config.reconnect,
            EventBus::new(),
        );
        let mut state = upstream.subscribe_state();

        let (extension_io, host_io) = duplex(64 * 1024);
        let (hr, hw) = split(host_io);
        let relay = NativeRelay::new(hr, hw, upstream, &config);

        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .expect("connected in time")
            .expect("state channel");

        let (er, ew) = split(extension_io);
        let extension = Connection::length_prefixed(er, ew, FramingOptions::default())
            .with_request_timeout(Duration::from_secs(5));

        let tabs = extension
            .request("tools/call", Some(json!({"name": "list_tabs"})))
            .await
            .expect("relayed");
        assert_eq!(tabs, json!({"tabs": []}));

        let err = extension
            .request("tools/call", Some(json!({"name": "missing"})))
            .await
            .unwrap_err();
        let (code, message, data) = match err {
            Error::Remote { code, message, data } => (code, message, data),
            other => panic!("expected remote error, got {other:?}"),
        };
        assert_eq!(code, codes::METHOD_NOT_FOUND);
        assert_eq!(message, "Tool not found: missing");
        assert_eq!(data, Some(json!({"kind": "tool", "name": "missing"})));

        relay.shutdown();
        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_request_while_disconnected_fails() {
        let config = BridgeConfig::default();
        let upstream = ReconnectingClient::new(
            WsConnector::new("ws://127.0.0.1:1"),
            crate::transport::ReconnectPolicy {
                max_attempts: Some(0),
                ..Default::default()
            },
            EventBus::new(),
        );

        let (extension_io, host_io) = duplex(64 * 1024);
        let (hr, hw) = split(host_io);
        let relay = NativeRelay::new(hr, hw, upstream, &config);

        let (er, ew) = split(extension_io);
        let extension = Connection::length_prefixed(er, ew, FramingOptions::default())
            .with_request_timeout(Duration::from_secs(5));

        let err = extension.request("ping", None).await.unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));

        relay.shutdown();
    }
}
