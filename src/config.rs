//! Bridge configuration.
//!
//! [`BridgeConfig`] is a plain value with sensible defaults, fluent
//! `with_*` setters and an environment overlay. The binary layers CLI flags
//! on top of [`BridgeConfig::from_env`].
//!
//! # Environment
//!
//! | Variable | Field |
//! |----------|-------|
//! | `BROWSER_BRIDGE_BIND` | `bind_address` |
//! | `BROWSER_BRIDGE_PORT` | `socket_port` |
//! | `BROWSER_BRIDGE_PRIMARY_PORTS` | `primary_ports` (`start-end`) |
//! | `BROWSER_BRIDGE_SECONDARY_PORTS` | `secondary_ports` (`start-end`) |
//! | `BROWSER_BRIDGE_REQUEST_TIMEOUT_MS` | `request_timeout` |
//! | `BROWSER_BRIDGE_COMPRESSION_THRESHOLD` | `framing.compression_threshold` |
//! | `BROWSER_BRIDGE_COALESCE_MS` | `framing.coalesce_window` |
//! | `BROWSER_BRIDGE_RECONNECT_DELAY_MS` | `reconnect.delay` |
//! | `BROWSER_BRIDGE_MAX_RECONNECT_ATTEMPTS` | `reconnect.max_attempts` |

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{DEFAULT_PRIMARY_RANGE, DEFAULT_SECONDARY_RANGE, PortRange};
use crate::transport::correlation::DEFAULT_REQUEST_TIMEOUT;
use crate::transport::length_prefixed::duration_ms;
use crate::transport::{Backoff, FramingOptions, ReconnectPolicy};

// ============================================================================
// Constants
// ============================================================================

/// Default socket server port.
pub const DEFAULT_SOCKET_PORT: u16 = 9009;

/// Prefix of every recognised environment variable.
pub const ENV_PREFIX: &str = "BROWSER_BRIDGE_";

// ============================================================================
// BridgeConfig
// ============================================================================

/// Runtime configuration of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Ports tried first for tab allocation.
    pub primary_ports: PortRange,
    /// Ports tried when the primary range is exhausted.
    pub secondary_ports: PortRange,
    /// Socket server bind address.
    pub bind_address: IpAddr,
    /// Socket server port; 0 lets the OS choose.
    pub socket_port: u16,
    /// Default correlated request timeout.
    #[serde(with = "duration_ms", rename = "requestTimeoutMs")]
    pub request_timeout: Duration,
    /// Length-prefixed writer tuning.
    pub framing: FramingOptions,
    /// Reconnecting client policy.
    pub reconnect: ReconnectPolicy,
    /// Name reported by `initialize` and the health probe.
    pub server_name: String,
    /// Version reported by `initialize`.
    pub server_version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            primary_ports: DEFAULT_PRIMARY_RANGE,
            secondary_ports: DEFAULT_SECONDARY_RANGE,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket_port: DEFAULT_SOCKET_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            framing: FramingOptions::default(),
            reconnect: ReconnectPolicy::default(),
            server_name: env!("CARGO_PKG_NAME").to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl BridgeConfig {
    /// Creates the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both allocation ranges.
    #[inline]
    #[must_use]
    pub fn with_port_ranges(mut self, primary: PortRange, secondary: PortRange) -> Self {
        self.primary_ports = primary;
        self.secondary_ports = secondary;
        self
    }

    /// Sets the socket server bind address.
    #[inline]
    #[must_use]
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Sets the socket server port.
    #[inline]
    #[must_use]
    pub fn with_socket_port(mut self, port: u16) -> Self {
        self.socket_port = port;
        self
    }

    /// Sets the default request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the compression threshold in bytes.
    #[inline]
    #[must_use]
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.framing.compression_threshold = threshold;
        self
    }

    /// Sets the write coalescing window.
    #[inline]
    #[must_use]
    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.framing.coalesce_window = window;
        self
    }

    /// Sets the whole reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the base reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    /// Enables exponential backoff capped at `max_delay`.
    #[inline]
    #[must_use]
    pub fn with_exponential_backoff(mut self, max_delay: Duration) -> Self {
        self.reconnect.backoff = Backoff::Exponential { max_delay };
        self
    }

    /// Limits reconnect attempts.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    /// Sets the reported server identity.
    #[inline]
    #[must_use]
    pub fn with_server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_name = name.into();
        self.server_version = version.into();
        self
    }
}

// ============================================================================
// Accessors & Validation
// ============================================================================

impl BridgeConfig {
    /// Returns the socket server address.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.socket_port)
    }

    /// Returns the WebSocket URL a native host should dial.
    #[must_use]
    pub fn socket_url(&self) -> String {
        format!("ws://{}", self.socket_addr())
    }

    /// Checks the configuration for values the bridge cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for (label, range) in [("primary", self.primary_ports), ("secondary", self.secondary_ports)] {
            if range.is_empty() {
                return Err(Error::config(format!(
                    "{label} port range {}-{} is empty",
                    range.start, range.end
                )));
            }
            if range.start == 0 {
                return Err(Error::config(format!("{label} port range must not include port 0")));
            }
        }

        if self.request_timeout.is_zero() {
            return Err(Error::config("request timeout must be greater than zero"));
        }

        if self.server_name.trim().is_empty() {
            return Err(Error::config("server name must not be empty"));
        }

        Ok(())
    }
}

// ============================================================================
// Environment
// ============================================================================

impl BridgeConfig {
    /// Returns the defaults overlaid with `BROWSER_BRIDGE_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is present but unparseable.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlays values found through `lookup`, keyed by full variable name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is present but unparseable.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let key = format!("{ENV_PREFIX}{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("BIND") {
            self.bind_address = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("PORT") {
            self.socket_port = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("PRIMARY_PORTS") {
            self.primary_ports = parse_range(&key, &value)?;
        }
        if let Some((key, value)) = get("SECONDARY_PORTS") {
            self.secondary_ports = parse_range(&key, &value)?;
        }
        if let Some((key, value)) = get("REQUEST_TIMEOUT_MS") {
            self.request_timeout = Duration::from_millis(parse(&key, &value)?);
        }
        if let Some((key, value)) = get("COMPRESSION_THRESHOLD") {
            self.framing.compression_threshold = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("COALESCE_MS") {
            self.framing.coalesce_window = Duration::from_millis(parse(&key, &value)?);
        }
        if let Some((key, value)) = get("RECONNECT_DELAY_MS") {
            self.reconnect.delay = Duration::from_millis(parse(&key, &value)?);
        }
        if let Some((key, value)) = get("MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = Some(parse(&key, &value)?);
        }

        Ok(self)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{key}={value}: {e}")))
}

fn parse_range(key: &str, value: &str) -> Result<PortRange> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| Error::config(format!("{key}={value}: expected start-end")))?;
    Ok(PortRange::new(parse(key, start)?, parse(key, end)?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use rustc_hash::FxHashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.primary_ports, DEFAULT_PRIMARY_RANGE);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.framing.compression_threshold, 1024);
        assert_eq!(config.reconnect.delay, Duration::from_millis(2000));
        assert_eq!(config.socket_url(), "ws://127.0.0.1:9009");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay() {
        let config = BridgeConfig::default()
            .overlay(env(&[
                ("BROWSER_BRIDGE_PORT", "4000"),
                ("BROWSER_BRIDGE_PRIMARY_PORTS", "5000-5009"),
                ("BROWSER_BRIDGE_MAX_RECONNECT_ATTEMPTS", "3"),
                ("BROWSER_BRIDGE_COALESCE_MS", "0"),
            ]))
            .expect("overlay");

        assert_eq!(config.socket_port, 4000);
        assert_eq!(config.primary_ports, PortRange::new(5000, 5009));
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.framing.coalesce_window, Duration::ZERO);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = BridgeConfig::default()
            .overlay(env(&[("BROWSER_BRIDGE_PORT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("BROWSER_BRIDGE_PORT"));

        assert!(
            BridgeConfig::default()
                .overlay(env(&[("BROWSER_BRIDGE_PRIMARY_PORTS", "5000")]))
                .is_err()
        );
    }

    #[test]
    fn test_validate() {
        let config = BridgeConfig::default()
            .with_port_ranges(PortRange::new(10, 5), DEFAULT_SECONDARY_RANGE);
        assert!(config.validate().is_err());

        let config = BridgeConfig::default().with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_camel_case() {
        let config = BridgeConfig::default().with_max_reconnect_attempts(Some(2));
        let value = serde_json::to_value(&config).expect("serialize");
        assert_eq!(value["requestTimeoutMs"], 30_000);
        assert_eq!(value["reconnect"]["maxAttempts"], 2);

        let parsed: BridgeConfig =
            serde_json::from_value(serde_json::json!({"socketPort": 0})).expect("parse");
        assert_eq!(parsed.socket_port, 0);
        assert_eq!(parsed.server_name, "browser-bridge");
    }
}
