//! Bridge composition root.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Bridge`] | Owns the registries and serves the dispatcher |
//! | [`BridgeBuilder`] | Fluent configuration builder |
//! | [`NativeRelay`] | Native messaging host relaying to the socket server |
//!
//! # Example
//!
//! ```no_run
//! use browser_bridge::{Bridge, Result};
//!
//! # async fn example() -> Result<()> {
//! let bridge = Bridge::builder().build()?;
//! bridge.start_socket_server().await?;
//! bridge.serve_stdio().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for bridge configuration.
pub mod builder;

/// Core bridge implementation.
pub mod core;

/// Native messaging host relay.
pub mod relay;

/// Built-in tools and prompts.
mod tools;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::BridgeBuilder;
pub use core::Bridge;
pub use relay::NativeRelay;
