//! Bridge composition root.
//!
//! The [`Bridge`] owns one instance of every registry, wires them together
//! through the event bus and exposes the dispatcher over the configured
//! transports.
//!
//! # Event Wiring
//!
//! | Event | Reaction |
//! |-------|----------|
//! | `TabActivated` | create the tab's resources and register them |
//! | `TabDeactivated` | unregister resources, drop the snapshot, release the port |
//! | any | `debug!` log line |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{stdin, stdout};
use tracing::{debug, info};

use crate::adapter::{BrowserAdapter, CapabilityDetector};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::events::{BridgeEvent, EventBus, EventKind, Subscription};
use crate::identifiers::{SubscriptionId, TabId};
use crate::resources::{ResourceMapper, namespace};
use crate::server::Dispatcher;
use crate::session::{PortAllocator, TabRecord, TabRegistry};
use crate::transport::{Connection, LineReader, LineWriter, SocketServer};

use super::builder::BridgeBuilder;
use super::tools;

// ============================================================================
// Types
// ============================================================================

/// URL each active tab's resources were registered for.
type RegisteredTabs = Arc<Mutex<FxHashMap<TabId, String>>>;

/// Internal shared state for the bridge.
pub(crate) struct BridgeInner {
    /// Effective configuration.
    pub config: BridgeConfig,
    /// Event bus shared by every registry.
    pub events: EventBus,
    /// Port reservations.
    pub ports: Arc<PortAllocator>,
    /// Sessions and active tabs.
    pub tabs: Arc<TabRegistry>,
    /// Per-tab snapshots.
    pub mapper: ResourceMapper,
    /// Tool/resource/prompt registries.
    pub dispatcher: Arc<Dispatcher>,
    /// Browser debugging adapter.
    pub adapter: Option<Arc<dyn BrowserAdapter>>,
    /// Framework detector.
    pub detector: Option<Arc<dyn CapabilityDetector>>,
    /// Running socket server.
    pub socket: Mutex<Option<Arc<SocketServer>>>,
    /// Internal event listeners.
    pub subscriptions: Mutex<Vec<Subscription>>,
}

// ============================================================================
// Bridge
// ============================================================================

/// The bridge between AI clients and browser tabs.
///
/// Cheap to clone; all clones share the same registries.
#[derive(Clone)]
pub struct Bridge {
    /// Shared inner state.
    pub(crate) inner: Arc<BridgeInner>,
}

// ============================================================================
// Bridge - Display
// ============================================================================

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("server", &self.inner.config.server_name)
            .field("active_tabs", &self.inner.tabs.active_tabs().len())
            .field("adapter", &self.inner.adapter.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Bridge - Construction
// ============================================================================

impl Bridge {
    /// Creates a configuration builder for the bridge.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Assembles the registries. Called by [`BridgeBuilder::build`].
    pub(crate) fn new(
        config: BridgeConfig,
        events: EventBus,
        adapter: Option<Arc<dyn BrowserAdapter>>,
        detector: Option<Arc<dyn CapabilityDetector>>,
    ) -> Self {
        let ports = Arc::new(
            PortAllocator::new(config.primary_ports, config.secondary_ports)
                .with_events(events.clone()),
        );
        let tabs = Arc::new(TabRegistry::new(Arc::clone(&ports), events.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            config.server_name.clone(),
            config.server_version.clone(),
        ));

        let bridge = Self {
            inner: Arc::new(BridgeInner {
                config,
                events,
                ports,
                tabs,
                mapper: ResourceMapper::new(),
                dispatcher,
                adapter,
                detector,
                socket: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        bridge.wire_events();
        tools::register_builtins(&bridge.inner);

        debug!(
            server = %bridge.inner.config.server_name,
            tools = bridge.inner.dispatcher.list_tools().len(),
            "Bridge assembled"
        );

        bridge
    }

    /// Subscribes the internal observers.
    fn wire_events(&self) {
        let inner = &self.inner;
        let registered: RegisteredTabs = Arc::default();
        let mut subscriptions = Vec::with_capacity(3);

        {
            let mapper = inner.mapper.clone();
            let dispatcher = Arc::clone(&inner.dispatcher);
            let registered = Arc::clone(&registered);

            subscriptions.push(inner.events.on(EventKind::TabActivated, move |event| {
                let BridgeEvent::TabActivated { tab_id, url, .. } = event else {
                    return;
                };
                let resources = mapper.create_resources_for_tab(*tab_id, url);
                let count = resources.len();
                for resource in resources {
                    dispatcher.register_resource(resource);
                }
                registered.lock().insert(*tab_id, url.clone());
                debug!(tab_id = %tab_id, count, "Tab resources registered");
            }));
        }

        {
            let mapper = inner.mapper.clone();
            let dispatcher = Arc::clone(&inner.dispatcher);
            let ports: Weak<PortAllocator> = Arc::downgrade(&inner.ports);
            let registered = Arc::clone(&registered);

            subscriptions.push(inner.events.on(EventKind::TabDeactivated, move |event| {
                let BridgeEvent::TabDeactivated { tab_id } = event else {
                    return;
                };
                mapper.clear_tab(*tab_id);
                if let Some(ports) = ports.upgrade() {
                    ports.release_port(*tab_id);
                }

                let (url, survivor) = {
                    let mut registered = registered.lock();
                    let Some(url) = registered.remove(tab_id) else {
                        return;
                    };
                    let namespace = namespace::namespace_for(&url);
                    let survivor = registered
                        .iter()
                        .find(|(_, other)| namespace::namespace_for(other) == namespace)
                        .map(|(id, other)| (*id, other.clone()));
                    (url, survivor)
                };

                // Tabs sharing a namespace share URIs; hand them to the survivor.
                match survivor {
                    Some((other_tab, other_url)) => {
                        for resource in mapper.create_resources_for_tab(other_tab, &other_url) {
                            dispatcher.register_resource(resource);
                        }
                        debug!(tab_id = %tab_id, survivor = %other_tab, "Tab resources handed over");
                    }
                    None => {
                        for uri in ResourceMapper::resource_uris(&url) {
                            dispatcher.unregister_resource(&uri);
                        }
                        debug!(tab_id = %tab_id, "Tab resources removed");
                    }
                }
            }));
        }

        for kind in EventKind::ALL {
            subscriptions.push(inner.events.on(kind, |event| {
                debug!(?event, "Bridge event");
            }));
        }

        inner.subscriptions.lock().extend(subscriptions);
    }
}

// ============================================================================
// Bridge - Accessors
// ============================================================================

impl Bridge {
    /// Returns the effective configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Returns the shared event bus.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Returns the port allocator.
    #[inline]
    #[must_use]
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.inner.ports
    }

    /// Returns the session/tab registry.
    #[inline]
    #[must_use]
    pub fn tabs(&self) -> &Arc<TabRegistry> {
        &self.inner.tabs
    }

    /// Returns the resource mapper.
    #[inline]
    #[must_use]
    pub fn mapper(&self) -> &ResourceMapper {
        &self.inner.mapper
    }

    /// Returns the dispatcher.
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Returns the socket server, once started.
    #[must_use]
    pub fn socket_server(&self) -> Option<Arc<SocketServer>> {
        self.inner.socket.lock().clone()
    }
}

// ============================================================================
// Bridge - Tabs
// ============================================================================

impl Bridge {
    /// Allocates a port for `tab_id` and activates it.
    ///
    /// The reservation is released again if activation fails.
    ///
    /// # Errors
    ///
    /// - [`Error::NoAvailablePort`](crate::Error::NoAvailablePort) if both ranges are exhausted
    /// - [`Error::TabAlreadyActive`](crate::Error::TabAlreadyActive) if the tab is active
    pub async fn activate_tab(
        &self,
        tab_id: TabId,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<TabRecord> {
        tools::activate(&self.inner.ports, &self.inner.tabs, tab_id, url.into(), title.into(), None)
            .await
    }

    /// Deactivates a tab. Resources and port are released by the observers.
    pub fn deactivate_tab(&self, tab_id: TabId) -> Option<TabRecord> {
        self.inner.tabs.deactivate_tab(tab_id)
    }
}

// ============================================================================
// Bridge - Serving
// ============================================================================

impl Bridge {
    /// Answers requests arriving on `connection`.
    pub fn serve_connection(&self, connection: &Connection) -> SubscriptionId {
        self.inner.dispatcher.serve(connection)
    }

    /// Serves newline-delimited JSON-RPC on stdin/stdout until stdin closes.
    pub async fn serve_stdio(&self) {
        let (connection, startup) =
            Connection::deferred("line", LineReader::new(stdin()), LineWriter::new(stdout()));
        let connection = connection.with_request_timeout(self.inner.config.request_timeout);
        self.serve_connection(&connection);
        startup.start();

        info!(server = %self.inner.config.server_name, "Serving on stdio");
        connection.closed().await;
        info!("Stdio closed");
    }

    /// Binds the socket server and serves every peer.
    ///
    /// Returns the running server; calling again returns the same server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub async fn start_socket_server(&self) -> Result<Arc<SocketServer>> {
        if let Some(server) = self.socket_server() {
            return Ok(server);
        }

        let server = SocketServer::bind(
            self.inner.config.socket_addr(),
            self.inner.config.server_name.clone(),
            self.inner.events.clone(),
            self.inner.config.request_timeout,
        )
        .await?;

        let dispatcher = Arc::clone(&self.inner.dispatcher);
        server.on_peer(move |peer_id, connection| {
            dispatcher.serve(connection);
            debug!(peer_id = %peer_id, "Dispatcher attached to peer");
        });

        *self.inner.socket.lock() = Some(Arc::clone(&server));
        Ok(server)
    }

    /// Stops the socket server, deactivates every tab and clears registries.
    pub fn shutdown(&self) {
        if let Some(server) = self.inner.socket.lock().take() {
            server.shutdown();
        }

        for record in self.inner.tabs.active_tabs() {
            self.inner.tabs.deactivate_tab(record.tab_id);
        }
        self.inner.tabs.clear_all();
        self.inner.dispatcher.shutdown();

        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }

        info!(server = %self.inner.config.server_name, "Bridge shut down");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use serde_json::json;

    use crate::error::Error;
    use crate::session::PortRange;

    fn bridge() -> Bridge {
        Bridge::builder()
            .config(
                BridgeConfig::default()
                    .with_port_ranges(PortRange::new(43100, 43119), PortRange::new(43200, 43219))
                    .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
                    .with_socket_port(0),
            )
            .build()
            .expect("build")
    }

    fn tab(id: u32) -> TabId {
        TabId::new(id).expect("non-zero")
    }

    #[tokio::test]
    async fn test_activation_registers_resources() {
        let bridge = bridge();
        let record = bridge
            .activate_tab(tab(42), "http://localhost:3000/app", "App")
            .await
            .expect("activate");

        assert_eq!(record.base_uri(), "browser://tab-localhost-3000/");
        assert_eq!(
            bridge.tabs().get_virtual_filesystem_uri(tab(42)).as_deref(),
            Some("browser://tab-localhost-3000/")
        );
        assert_eq!(bridge.dispatcher().list_resources().len(), 4);

        bridge.mapper().set_html(tab(42), "<p>hi</p>");
        let content = bridge
            .dispatcher()
            .get_resource_content("browser://tab-localhost-3000/dom/html")
            .await
            .expect("read");
        assert_eq!(content.text, "<p>hi</p>");
    }

    #[tokio::test]
    async fn test_deactivation_cleans_up() {
        let bridge = bridge();
        let record = bridge
            .activate_tab(tab(42), "http://localhost:3000/", "App")
            .await
            .expect("activate");
        assert_eq!(bridge.ports().port_for(tab(42)), Some(record.port));

        assert!(bridge.deactivate_tab(tab(42)).is_some());
        assert!(bridge.deactivate_tab(tab(42)).is_none());

        assert_eq!(bridge.tabs().get_virtual_filesystem_uri(tab(42)), None);
        assert!(bridge.dispatcher().list_resources().is_empty());
        assert!(!bridge.mapper().has_tab(tab(42)));
        assert_eq!(bridge.ports().port_for(tab(42)), None);
    }

    #[tokio::test]
    async fn test_double_activation_keeps_port() {
        let bridge = bridge();
        let record = bridge
            .activate_tab(tab(7), "https://example.com", "Example")
            .await
            .expect("activate");

        let err = bridge
            .activate_tab(tab(7), "https://example.com", "Example")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TabAlreadyActive { .. }));
        assert_eq!(bridge.ports().port_for(tab(7)), Some(record.port));
    }

    #[tokio::test]
    async fn test_builtin_tools_over_dispatcher() {
        let bridge = bridge();
        let dispatcher = bridge.dispatcher();

        let record = dispatcher
            .execute_tool(
                "activate_tab",
                json!({"tabId": 5, "url": "http://127.0.0.1:8080/", "title": "Local"}),
            )
            .await
            .expect("activate");
        assert_eq!(record["resourceNamespace"], "tab-127-0-0-1-8080");

        dispatcher
            .execute_tool("pin_tab", json!({"sessionId": "ide-1", "tabId": 5}))
            .await
            .expect("pin");
        let pinned = dispatcher
            .execute_tool("get_pinned_tab", json!({"sessionId": "ide-1"}))
            .await
            .expect("pinned");
        assert_eq!(pinned["tabId"], 5);

        let listed = dispatcher.execute_tool("list_tabs", json!({})).await.expect("list");
        assert_eq!(listed["tabs"].as_array().map(Vec::len), Some(1));

        assert!(dispatcher.execute_tool("browser_command", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_socket_server_serves_dispatcher() {
        let bridge = bridge();
        let server = bridge.start_socket_server().await.expect("bind");
        let again = bridge.start_socket_server().await.expect("same");
        assert_eq!(server.port(), again.port());

        let (stream, _) = tokio_tungstenite::connect_async(server.ws_url())
            .await
            .expect("connect");
        let client = Connection::websocket(stream);
        let result = client.request("ping", None).await.expect("ping");
        assert_eq!(result, json!({}));

        bridge.shutdown();
        assert!(bridge.socket_server().is_none());
    }
}
