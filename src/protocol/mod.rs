//! JSON-RPC 2.0 message types.
//!
//! This module defines the messages exchanged over every transport and the
//! payloads of the tool/resource/prompt method surface.
//!
//! # Message Kinds
//!
//! Classification is structural, based on which fields are present:
//!
//! | Kind | Fields | Answered |
//! |------|--------|----------|
//! | [`Request`] | `id` + `method` | yes |
//! | [`Notification`] | `method`, no `id` | never |
//! | [`Response`] | `id` + `result` or `error` | - |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codes` | JSON-RPC error codes |
//! | `message` | Request, Notification, Response, Message |
//! | `mcp` | Tool/resource/prompt descriptors and method params |

// ============================================================================
// Submodules
// ============================================================================

/// JSON-RPC error codes.
pub mod codes;

/// Tool, resource and prompt payload types.
pub mod mcp;

/// Request, Notification and Response message types.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use mcp::{
    CallToolParams, GetPromptParams, GetPromptResult, InitializeResult, PromptArgument,
    PromptInfo, PromptMessage, ReadResourceParams, ResourceContent, ResourceInfo,
    ServerCapabilities, ServerInfo, ToolInfo,
};
pub use message::{JSONRPC_VERSION, Message, Notification, Request, Response, RpcError};
