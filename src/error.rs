//! Error types for the browser bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use browser_bridge::{Bridge, Error, Result, TabId};
//!
//! fn title(bridge: &Bridge, tab: TabId) -> Result<String> {
//!     let record = bridge.tabs().get_tab(tab).ok_or(Error::tab_not_found(tab))?;
//!     Ok(record.title)
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Not found | [`Error::ToolNotFound`], [`Error::ResourceNotFound`], [`Error::PromptNotFound`], [`Error::SessionNotFound`], [`Error::TabNotFound`], [`Error::PeerNotFound`] |
//! | Conflict | [`Error::PortAlreadyReserved`], [`Error::TabAlreadyActive`], [`Error::PortNotReserved`], [`Error::DuplicateRequestId`] |
//! | Exhaustion | [`Error::NoAvailablePort`], [`Error::ReconnectExhausted`] |
//! | Timeout | [`Error::RequestTimeout`], [`Error::ConnectionTimeout`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Protocol`], [`Error::FrameTooLarge`] |
//! | Provider | [`Error::Provider`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{PeerId, RequestId, SessionId, TabId};
use crate::protocol::codes;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when bridge configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Registry Errors
    // ========================================================================
    /// No tool registered under this name.
    #[error("Tool not found: {name}")]
    ToolNotFound {
        /// Requested tool name.
        name: String,
    },

    /// No resource registered under this URI.
    #[error("Resource not found: {uri}")]
    ResourceNotFound {
        /// Requested resource URI.
        uri: String,
    },

    /// No prompt registered under this name.
    #[error("Prompt not found: {name}")]
    PromptNotFound {
        /// Requested prompt name.
        name: String,
    },

    /// Session has no binding.
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The unknown session.
        session_id: SessionId,
    },

    /// Tab is not active.
    #[error("Tab not found: {tab_id}")]
    TabNotFound {
        /// The missing tab ID.
        tab_id: TabId,
    },

    /// Socket peer is not connected.
    #[error("Peer not found: {peer_id}")]
    PeerNotFound {
        /// The missing peer.
        peer_id: PeerId,
    },

    // ========================================================================
    // Conflict Errors
    // ========================================================================
    /// Port is already reserved by another tab.
    #[error("Port {port} already reserved by tab {holder}")]
    PortAlreadyReserved {
        /// The contested port.
        port: u16,
        /// Tab currently holding the port.
        holder: TabId,
    },

    /// Tab is already active.
    #[error("Tab already active: {tab_id}")]
    TabAlreadyActive {
        /// The active tab.
        tab_id: TabId,
    },

    /// Tab activation referenced a port that is not reserved for it.
    #[error("Port {port} is not reserved for tab {tab_id}")]
    PortNotReserved {
        /// The tab being activated.
        tab_id: TabId,
        /// The port passed to activation.
        port: u16,
    },

    /// A request with this id is already pending on the transport.
    #[error("Duplicate pending request id: {request_id}")]
    DuplicateRequestId {
        /// The colliding id.
        request_id: RequestId,
    },

    // ========================================================================
    // Exhaustion Errors
    // ========================================================================
    /// Both port ranges are exhausted.
    #[error("No available port in {primary_start}-{primary_end} or {secondary_start}-{secondary_end}")]
    NoAvailablePort {
        /// First port of the primary range.
        primary_start: u16,
        /// Last port of the primary range.
        primary_end: u16,
        /// First port of the secondary range.
        secondary_start: u16,
        /// Last port of the secondary range.
        secondary_end: u16,
    },

    /// Reconnection stopped after the configured attempt limit.
    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection failed.
    ///
    /// Returned when a transport cannot be established or written.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Transport closed while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Invalid argument in request params.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Declared frame length exceeds the transport limit.
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Request timeout.
    ///
    /// Returned when no correlated response arrives in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The peer answered with a JSON-RPC error.
    ///
    /// Displays the peer's message unchanged.
    #[error("{message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the peer.
        message: String,
        /// Structured error data from the peer.
        data: Option<Value>,
    },

    // ========================================================================
    // Provider Errors
    // ========================================================================
    /// A registered tool, resource or prompt handler failed.
    #[error("{message}")]
    Provider {
        /// Message reported by the handler.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a tool not found error.
    #[inline]
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    /// Creates a resource not found error.
    #[inline]
    pub fn resource_not_found(uri: impl Into<String>) -> Self {
        Self::ResourceNotFound { uri: uri.into() }
    }

    /// Creates a prompt not found error.
    #[inline]
    pub fn prompt_not_found(name: impl Into<String>) -> Self {
        Self::PromptNotFound { name: name.into() }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(session_id: SessionId) -> Self {
        Self::SessionNotFound { session_id }
    }

    /// Creates a tab not found error.
    #[inline]
    pub fn tab_not_found(tab_id: TabId) -> Self {
        Self::TabNotFound { tab_id }
    }

    /// Creates a peer not found error.
    #[inline]
    pub fn peer_not_found(peer_id: PeerId) -> Self {
        Self::PeerNotFound { peer_id }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a provider error.
    #[inline]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if a tool, resource, prompt, session, tab or peer was absent.
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound { .. }
                | Self::ResourceNotFound { .. }
                | Self::PromptNotFound { .. }
                | Self::SessionNotFound { .. }
                | Self::TabNotFound { .. }
                | Self::PeerNotFound { .. }
        )
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::ReconnectExhausted { .. }
                | Self::WebSocket(_)
                | Self::ChannelClosed(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry or with different input.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_not_found()
            || matches!(
                self,
                Self::ConnectionTimeout { .. }
                    | Self::RequestTimeout { .. }
                    | Self::PortAlreadyReserved { .. }
                    | Self::TabAlreadyActive { .. }
                    | Self::NoAvailablePort { .. }
                    | Self::DuplicateRequestId { .. }
            )
    }

    /// Maps this error onto a JSON-RPC error code.
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::ToolNotFound { .. } | Self::ResourceNotFound { .. } | Self::PromptNotFound { .. } => {
                codes::METHOD_NOT_FOUND
            }
            Self::InvalidArgument { .. } => codes::INVALID_PARAMS,
            Self::Json(_) => codes::INVALID_PARAMS,
            Self::Remote { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "Connection failed: failed to connect");
    }

    #[test]
    fn test_provider_error_keeps_message() {
        let err = Error::provider("tab has no DOM snapshot yet");
        assert_eq!(err.to_string(), "tab has no DOM snapshot yet");
        assert_eq!(err.rpc_code(), codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_not_found_maps_to_method_not_found() {
        assert_eq!(Error::tool_not_found("x").rpc_code(), -32601);
        assert_eq!(Error::resource_not_found("browser://x").rpc_code(), -32601);
        assert_eq!(Error::prompt_not_found("x").rpc_code(), -32601);
        assert!(Error::tool_not_found("x").is_not_found());
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::request_timeout(RequestId::Number(1), 5000);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        let conn_err = Error::connection("test");
        let timeout_err = Error::ConnectionTimeout { timeout_ms: 1000 };
        let closed_err = Error::ConnectionClosed;
        let other_err = Error::config("test");

        assert!(conn_err.is_connection_error());
        assert!(timeout_err.is_connection_error());
        assert!(closed_err.is_connection_error());
        assert!(!other_err.is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        let tab = TabId::new(1).expect("valid tab id");
        let reserved = Error::PortAlreadyReserved {
            port: 3100,
            holder: tab,
        };
        let config_err = Error::config("test");

        assert!(reserved.is_recoverable());
        assert!(!config_err.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
