//! browser-bridge - JSON-RPC bridge between AI assistants and browser tabs.
//!
//! Many logical tool, resource and prompt requests are multiplexed over a
//! few physical transports: newline-delimited stdio to the AI client, a
//! length-prefixed native messaging channel to the browser extension, and a
//! WebSocket the extension side uses to reach the host.
//!
//! # Architecture
//!
//! ```text
//! AI client ──stdio──► Dispatcher ◄──WebSocket── Extension / native host
//!                         │
//!          ┌──────────────┼────────────────┐
//!          ▼              ▼                ▼
//!     TabRegistry   ResourceMapper   PortAllocator
//!          └────────── EventBus ───────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use browser_bridge::{Bridge, Result, TabId};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bridge = Bridge::builder().socket_port(0).build()?;
//!     let server = bridge.start_socket_server().await?;
//!     println!("extension peers connect to {}", server.ws_url());
//!
//!     if let Some(tab) = TabId::new(42) {
//!         let record = bridge.activate_tab(tab, "http://localhost:3000/", "App").await?;
//!         println!("resources under {}", record.base_uri());
//!     }
//!
//!     bridge.serve_stdio().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | Browser adapter and capability detector interfaces |
//! | [`bridge`] | Composition root, built-in tools, native host relay |
//! | [`config`] | [`BridgeConfig`] and environment overlay |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | In-process event bus |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | JSON-RPC message types |
//! | [`resources`] | Virtual resource namespaces and tab snapshots |
//! | [`server`] | Tool/resource/prompt dispatcher |
//! | [`session`] | Port allocation, session pinning, active tabs |
//! | [`transport`] | Framing, correlation, socket server, reconnection |

// ============================================================================
// Modules
// ============================================================================

/// Browser adapter and capability detector interfaces.
pub mod adapter;

/// Composition root.
///
/// Use [`Bridge::builder()`] to create a configured bridge.
pub mod bridge;

/// Runtime configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// In-process publish/subscribe.
pub mod events;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// JSON-RPC 2.0 message types.
pub mod protocol;

/// Virtual resource namespaces and tab snapshots.
pub mod resources;

/// Tool/resource/prompt dispatcher.
pub mod server;

/// Port allocation and session/tab registry.
pub mod session;

/// Transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Bridge types
pub use bridge::{Bridge, BridgeBuilder, NativeRelay};

// Configuration
pub use config::BridgeConfig;

// Error types
pub use error::{Error, Result};

// Events
pub use events::{BridgeEvent, EventBus, EventKind, Subscription};

// Identifier types
pub use identifiers::{PeerId, RequestId, SessionId, SubscriptionId, TabId};

// Protocol types
pub use protocol::{Message, Notification, Request, Response, RpcError};

// Server types
pub use server::{Dispatcher, Prompt, Resource, Tool};

// Transport types
pub use transport::{Connection, ReconnectingClient, SocketServer};
