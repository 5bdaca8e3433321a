//! Tool/resource/prompt server.
//!
//! # Methods
//!
//! | Method | Operation |
//! |--------|-----------|
//! | `initialize` | [`Dispatcher::initialize`] |
//! | `ping` | liveness |
//! | `tools/list`, `tools/call` | [`Dispatcher::list_tools`], [`Dispatcher::execute_tool`] |
//! | `resources/list`, `resources/read` | [`Dispatcher::list_resources`], [`Dispatcher::get_resource_content`] |
//! | `prompts/list`, `prompts/get` | [`Dispatcher::list_prompts`], [`Dispatcher::get_prompt`] |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `dispatcher` | Registries and method routing |
//! | `provider` | Tool, Resource and Prompt types |

// ============================================================================
// Submodules
// ============================================================================

/// Registries and method routing.
pub mod dispatcher;

/// Registrable providers.
pub mod provider;

// ============================================================================
// Re-exports
// ============================================================================

pub use dispatcher::{Dispatcher, PROTOCOL_VERSION};
pub use provider::{BoxFuture, Prompt, Resource, Tool};
