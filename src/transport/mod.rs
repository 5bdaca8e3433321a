//! Transport layer.
//!
//! Moves JSON-RPC messages between the bridge and its peers over three
//! framings, all driven by the same [`Connection`] event loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  stdio (line / length-prefixed)  ┌────────────────┐
//! │  AI client   │◄────────────────────────────────►│                │
//! └──────────────┘                                  │     Bridge     │
//! ┌──────────────┐        WebSocket :PORT           │                │
//! │  Extension   │◄────────────────────────────────►│  SocketServer  │
//! └──────────────┘                                  └────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. A reader/writer pair is wrapped by [`Connection::new`] or a helper
//! 2. Inbound frames are parsed and routed: responses to the
//!    [`Correlator`], everything else to message handlers
//! 3. [`Connection::request`] correlates an outbound request with its
//!    response, bounded by a timeout
//! 4. On transport close every pending request fails with
//!    `ConnectionClosed`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Length-prefixed frame codec with gzip payloads |
//! | `connection` | Connection event loop |
//! | `correlation` | Pending-request table |
//! | `frame` | Frame reader/writer traits |
//! | `length_prefixed` | Native-messaging style framing |
//! | `line` | Newline-delimited framing |
//! | `reconnect` | Reconnecting WebSocket client |
//! | `server` | WebSocket server with health probe |
//! | `socket` | WebSocket framing |

// ============================================================================
// Submodules
// ============================================================================

/// Length-prefixed frame codec.
pub mod codec;

/// Connection event loop.
pub mod connection;

/// Request/response correlation.
pub mod correlation;

/// Frame reader and writer traits.
pub mod frame;

/// Length-prefixed framing over byte streams.
pub mod length_prefixed;

/// Newline-delimited framing over byte streams.
pub mod line;

/// Reconnecting WebSocket client.
pub mod reconnect;

/// WebSocket server for extension peers.
pub mod server;

/// WebSocket framing.
pub mod socket;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{FrameDecoder, Payload, Priority};
pub use connection::{Connection, MessageHandler, Startup};
pub use correlation::{Correlator, DEFAULT_REQUEST_TIMEOUT};
pub use frame::{FrameReader, FrameWriter};
pub use length_prefixed::{FramingOptions, LengthPrefixedReader, LengthPrefixedWriter};
pub use line::{LineReader, LineWriter};
pub use reconnect::{
    Backoff, ConnectionState, Connector, ReconnectAction, ReconnectMachine, ReconnectPolicy,
    ReconnectingClient, WsConnector,
};
pub use server::{PeerHandler, SocketServer};
