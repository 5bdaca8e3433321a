//! Per-tab resource snapshots and their virtual descriptors.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::adapter::CapabilityInfo;
use crate::error::{Error, Result};
use crate::identifiers::TabId;
use crate::protocol::ResourceInfo;
use crate::server::Resource;

use super::namespace;

// ============================================================================
// Constants
// ============================================================================

/// Maximum retained console and network entries per tab.
pub const MAX_SNAPSHOT_ENTRIES: usize = 1000;

const MIME_HTML: &str = "text/html";
const MIME_JSON: &str = "application/json";

// ============================================================================
// Snapshot Entries
// ============================================================================

/// Console message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.log`
    Log,
    /// `console.debug`
    Debug,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error` and uncaught exceptions
    Error,
}

/// One console message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    /// Severity.
    pub level: ConsoleLevel,
    /// Message text.
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Script URL and line, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// One network request as seen by the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    /// Browser request id.
    pub request_id: String,
    /// HTTP method.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Response status; `None` while pending or on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Mutable content of one tab.
#[derive(Debug, Clone, Default)]
struct TabSnapshot {
    html: String,
    console_logs: VecDeque<ConsoleEntry>,
    network_requests: VecDeque<NetworkEntry>,
    frameworks: Vec<CapabilityInfo>,
}

/// Resource category under a tab namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Html,
    Console,
    Network,
    Frameworks,
}

impl Category {
    const ALL: [Self; 4] = [Self::Html, Self::Console, Self::Network, Self::Frameworks];

    fn path(self) -> &'static str {
        match self {
            Self::Html => "dom/html",
            Self::Console => "console/logs",
            Self::Network => "network/requests",
            Self::Frameworks => "metadata/frameworks",
        }
    }

    fn mime_type(self) -> &'static str {
        match self {
            Self::Html => MIME_HTML,
            Self::Console | Self::Network | Self::Frameworks => MIME_JSON,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Html => "DOM",
            Self::Console => "Console logs",
            Self::Network => "Network requests",
            Self::Frameworks => "Frameworks",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Html => "Current document markup",
            Self::Console => "Console messages captured from the page",
            Self::Network => "Network requests issued by the page",
            Self::Frameworks => "Frameworks detected on the page",
        }
    }

    fn render(self, snapshot: &TabSnapshot) -> Result<String> {
        Ok(match self {
            Self::Html => snapshot.html.clone(),
            Self::Console => serde_json::to_string_pretty(&snapshot.console_logs)?,
            Self::Network => serde_json::to_string_pretty(&snapshot.network_requests)?,
            Self::Frameworks => serde_json::to_string_pretty(&snapshot.frameworks)?,
        })
    }
}

type SnapshotMap = FxHashMap<TabId, TabSnapshot>;

// ============================================================================
// ResourceMapper
// ============================================================================

/// Maps tabs to virtual resources backed by live snapshots.
///
/// Cloning is cheap; clones share the snapshot table.
#[derive(Clone, Default)]
pub struct ResourceMapper {
    snapshots: Arc<RwLock<SnapshotMap>>,
}

impl fmt::Debug for ResourceMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMapper")
            .field("tabs", &self.snapshots.read().len())
            .finish()
    }
}

impl ResourceMapper {
    /// Creates an empty mapper.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the namespace root URI for `url`.
    #[inline]
    #[must_use]
    pub fn get_base_uri(&self, url: &str) -> String {
        namespace::base_uri(url)
    }

    /// Creates the snapshot of `tab_id` and returns its four resources.
    ///
    /// An existing snapshot is kept, so re-creating descriptors never loses
    /// captured content.
    pub fn create_resources_for_tab(&self, tab_id: TabId, url: &str) -> Vec<Resource> {
        self.snapshots.write().entry(tab_id).or_default();

        let base = namespace::base_uri(url);
        debug!(tab_id = %tab_id, base_uri = %base, "Created tab resources");

        Category::ALL
            .iter()
            .map(|&category| {
                let uri = format!("{base}{}", category.path());
                let info = ResourceInfo {
                    uri: uri.clone(),
                    name: format!("{} (tab {tab_id})", category.label()),
                    description: category.description().to_string(),
                    mime_type: category.mime_type().to_string(),
                };

                let snapshots = Arc::clone(&self.snapshots);
                Resource::new(info, move || {
                    let rendered = match snapshots.read().get(&tab_id) {
                        Some(snapshot) => category.render(snapshot),
                        None => Err(Error::resource_not_found(uri.clone())),
                    };
                    async move { rendered }
                })
            })
            .collect()
    }

    /// Returns the URIs `create_resources_for_tab` produces for `url`.
    #[must_use]
    pub fn resource_uris(url: &str) -> Vec<String> {
        let base = namespace::base_uri(url);
        Category::ALL
            .iter()
            .map(|c| format!("{base}{}", c.path()))
            .collect()
    }

    /// Returns `true` if `tab_id` has a snapshot.
    #[inline]
    #[must_use]
    pub fn has_tab(&self, tab_id: TabId) -> bool {
        self.snapshots.read().contains_key(&tab_id)
    }

    /// Replaces the document markup.
    pub fn set_html(&self, tab_id: TabId, html: impl Into<String>) {
        self.update(tab_id, |s| s.html = html.into());
    }

    /// Replaces the console log, keeping the newest entries.
    pub fn set_console_logs(&self, tab_id: TabId, logs: Vec<ConsoleEntry>) {
        self.update(tab_id, |s| s.console_logs = capped(logs));
    }

    /// Appends one console entry, dropping the oldest past the cap.
    pub fn push_console_log(&self, tab_id: TabId, entry: ConsoleEntry) {
        self.update(tab_id, |s| push_capped(&mut s.console_logs, entry));
    }

    /// Replaces the network log, keeping the newest entries.
    pub fn set_network_requests(&self, tab_id: TabId, requests: Vec<NetworkEntry>) {
        self.update(tab_id, |s| s.network_requests = capped(requests));
    }

    /// Appends one network entry, dropping the oldest past the cap.
    pub fn push_network_request(&self, tab_id: TabId, entry: NetworkEntry) {
        self.update(tab_id, |s| push_capped(&mut s.network_requests, entry));
    }

    /// Replaces the detected frameworks.
    pub fn set_frameworks(&self, tab_id: TabId, frameworks: Vec<CapabilityInfo>) {
        self.update(tab_id, |s| s.frameworks = frameworks);
    }

    /// Discards the snapshot of `tab_id`.
    pub fn clear_tab(&self, tab_id: TabId) -> bool {
        let removed = self.snapshots.write().remove(&tab_id).is_some();
        if removed {
            debug!(tab_id = %tab_id, "Cleared tab snapshot");
        }
        removed
    }

    fn update(&self, tab_id: TabId, apply: impl FnOnce(&mut TabSnapshot)) {
        match self.snapshots.write().get_mut(&tab_id) {
            Some(snapshot) => apply(snapshot),
            None => trace!(tab_id = %tab_id, "Snapshot update for unknown tab ignored"),
        }
    }
}

fn capped<T>(items: Vec<T>) -> VecDeque<T> {
    let skip = items.len().saturating_sub(MAX_SNAPSHOT_ENTRIES);
    items.into_iter().skip(skip).collect()
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T) {
    if queue.len() >= MAX_SNAPSHOT_ENTRIES {
        queue.pop_front();
    }
    queue.push_back(item);
}

// ============================================================================
// Tests
// ============================================================================
