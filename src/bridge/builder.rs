//! Builder pattern for bridge configuration.
//!
//! # Example
//!
//! ```no_run
//! use browser_bridge::Bridge;
//!
//! # fn example() -> browser_bridge::Result<()> {
//! let bridge = Bridge::builder()
//!     .socket_port(0)
//!     .max_reconnect_attempts(5)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{BrowserAdapter, CapabilityDetector};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::events::EventBus;

use super::core::Bridge;

// ============================================================================
// BridgeBuilder
// ============================================================================

/// Builder for configuring a [`Bridge`] instance.
///
/// Use [`Bridge::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct BridgeBuilder {
    /// Base configuration.
    config: BridgeConfig,
    /// Browser debugging adapter.
    adapter: Option<Arc<dyn BrowserAdapter>>,
    /// Framework detector.
    detector: Option<Arc<dyn CapabilityDetector>>,
    /// Externally owned event bus.
    events: Option<EventBus>,
}

impl fmt::Debug for BridgeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeBuilder")
            .field("config", &self.config)
            .field("adapter", &self.adapter.is_some())
            .field("detector", &self.detector.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BridgeBuilder Implementation
// ============================================================================

impl BridgeBuilder {
    /// Creates a builder with the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the socket server port; 0 lets the OS choose.
    #[inline]
    #[must_use]
    pub fn socket_port(mut self, port: u16) -> Self {
        self.config.socket_port = port;
        self
    }

    /// Sets the default request timeout.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Limits reconnect attempts of the native host relay.
    #[inline]
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = Some(attempts);
        self
    }

    /// Sets the browser debugging adapter.
    ///
    /// Enables the `browser_command` tool.
    #[inline]
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn BrowserAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Sets the framework detector.
    ///
    /// Enables the `detect_capabilities` tool.
    #[inline]
    #[must_use]
    pub fn detector(mut self, detector: Arc<dyn CapabilityDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Shares an existing event bus instead of creating one.
    #[inline]
    #[must_use]
    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the bridge with validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration
    /// is unusable.
    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;

        Ok(Bridge::new(
            self.config,
            self.events.unwrap_or_default(),
            self.adapter,
            self.detector,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================
