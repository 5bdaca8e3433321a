//! Collaborator interfaces.
//!
//! The bridge does not speak a browser debugging protocol or identify
//! frameworks itself. Hosts plug those in through these traits.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::SubscriptionId;

// ============================================================================
// CapabilityInfo
// ============================================================================

/// A framework or library detected on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInfo {
    /// Framework name, e.g. `react`.
    pub name: String,
    /// Version string, when the page exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Detection confidence in `0.0..=1.0`.
    pub confidence: f32,
}

impl CapabilityInfo {
    /// Creates a detection with full confidence and no version.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            confidence: 1.0,
        }
    }

    /// Sets the version.
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the confidence, clamped to `0.0..=1.0`.
    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

// ============================================================================
// BrowserAdapter
// ============================================================================

/// Callback for adapter events: `(event method, params)`.
pub type AdapterEventHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Connection to a browser debugging protocol endpoint.
#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    /// Opens the underlying debugging session.
    async fn connect(&self) -> Result<()>;

    /// Enables a protocol domain, e.g. `Runtime`.
    async fn enable_domain(&self, domain: &str) -> Result<()>;

    /// Disables a protocol domain.
    async fn disable_domain(&self, domain: &str) -> Result<()>;

    /// Sends a raw protocol command and returns its result.
    async fn send_command(&self, method: &str, params: Value) -> Result<Value>;

    /// Subscribes to a protocol event.
    fn on(&self, event: &str, handler: AdapterEventHandler) -> SubscriptionId;

    /// Removes a subscription. Returns `false` if it was unknown.
    fn off(&self, subscription: SubscriptionId) -> bool;
}

// ============================================================================
// CapabilityDetector
// ============================================================================

/// Identifies frameworks on a page from different evidence sources.
#[async_trait]
pub trait CapabilityDetector: Send + Sync {
    /// Inspects window globals.
    async fn detect_from_globals(&self) -> Result<Vec<CapabilityInfo>>;

    /// Inspects DOM markers.
    async fn detect_from_dom(&self) -> Result<Vec<CapabilityInfo>>;

    /// Inspects loaded script URLs.
    async fn detect_from_scripts(&self) -> Result<Vec<CapabilityInfo>>;

    /// Runs every source and keeps the most confident hit per name.
    async fn detect_all(&self) -> Result<Vec<CapabilityInfo>> {
        let mut found: Vec<CapabilityInfo> = Vec::new();

        for batch in [
            self.detect_from_globals().await?,
            self.detect_from_dom().await?,
            self.detect_from_scripts().await?,
        ] {
            for info in batch {
                match found.iter_mut().find(|f| f.name == info.name) {
                    Some(existing) if existing.confidence < info.confidence => *existing = info,
                    Some(_) => {}
                    None => found.push(info),
                }
            }
        }

        found.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(found)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector;

    #[async_trait]
    impl CapabilityDetector for FixedDetector {
        async fn detect_from_globals(&self) -> Result<Vec<CapabilityInfo>> {
            Ok(vec![CapabilityInfo::new("react").with_confidence(0.6)])
        }

        async fn detect_from_dom(&self) -> Result<Vec<CapabilityInfo>> {
            Ok(vec![
                CapabilityInfo::new("react").with_version("18.2.0").with_confidence(0.9),
                CapabilityInfo::new("tailwind").with_confidence(0.4),
            ])
        }

        async fn detect_from_scripts(&self) -> Result<Vec<CapabilityInfo>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_detect_all_keeps_best_per_name() {
        let found = FixedDetector.detect_all().await.expect("detect");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "react");
        assert_eq!(found[0].version.as_deref(), Some("18.2.0"));
        assert_eq!(found[1].name, "tailwind");
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(CapabilityInfo::new("x").with_confidence(3.0).confidence, 1.0);
        assert_eq!(CapabilityInfo::new("x").with_confidence(-1.0).confidence, 0.0);
    }
}
