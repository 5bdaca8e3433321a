//! Session pinning and active-tab tracking.
//!
//! Two independent tables live here:
//!
//! - **Bindings**: at most one pinned tab per session. Re-pinning replaces
//!   the previous binding; many sessions may pin the same tab.
//! - **Tab records**: one record per active tab. Absence means inactive.
//!
//! Pinning does not require the tab to be active, and deactivating a tab
//! leaves bindings to it in place.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::identifiers::{SessionId, TabId};
use crate::resources::namespace;

use super::ports::PortAllocator;

// ============================================================================
// SessionBinding
// ============================================================================

/// A session pinned to a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    /// Pinning session.
    pub session_id: SessionId,
    /// Pinned tab.
    pub tab_id: TabId,
    /// Milliseconds since the Unix epoch; never decreases for a session.
    pub pinned_at: u64,
}

// ============================================================================
// TabRecord
// ============================================================================

/// An active tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    /// Tab id.
    pub tab_id: TabId,
    /// URL at activation.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Reserved port.
    pub port: u16,
    /// Detected client framework, if any.
    pub detected_capability: Option<String>,
    /// Always `true` for stored records.
    pub is_active: bool,
    /// Namespace derived from `url`.
    pub resource_namespace: String,
    /// Milliseconds since the Unix epoch.
    pub activated_at: u64,
}

impl TabRecord {
    /// Returns the namespace root URI.
    #[inline]
    #[must_use]
    pub fn base_uri(&self) -> String {
        namespace::base_uri_for_namespace(&self.resource_namespace)
    }
}

// ============================================================================
// TabRegistry
// ============================================================================

/// Tracks session bindings and active tabs.
///
/// Thread-safe; bindings and tab records are guarded by separate locks.
pub struct TabRegistry {
    /// Port reservations, consulted on activation.
    ports: Arc<PortAllocator>,
    /// Event sink.
    events: EventBus,
    /// Session bindings.
    bindings: Mutex<FxHashMap<SessionId, SessionBinding>>,
    /// Active tab records.
    tabs: RwLock<FxHashMap<TabId, TabRecord>>,
    /// Serializes reserve-then-activate sequences.
    activation: AsyncMutex<()>,
}

impl fmt::Debug for TabRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabRegistry")
            .field("bindings", &self.bindings.lock().len())
            .field("active_tabs", &self.tabs.read().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TabRegistry - Constructor
// ============================================================================

impl TabRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(ports: Arc<PortAllocator>, events: EventBus) -> Self {
        Self {
            ports,
            events,
            bindings: Mutex::new(FxHashMap::default()),
            tabs: RwLock::new(FxHashMap::default()),
            activation: AsyncMutex::new(()),
        }
    }
}

// ============================================================================
// TabRegistry - Pinning
// ============================================================================

impl TabRegistry {
    /// Pins `session_id` to `tab_id`, replacing any previous binding.
    pub fn pin_tab(&self, session_id: SessionId, tab_id: TabId) -> SessionBinding {
        let (binding, previous) = {
            let mut bindings = self.bindings.lock();
            let previous = bindings.get(&session_id).cloned();
            let floor = previous.as_ref().map_or(0, |b| b.pinned_at);

            let binding = SessionBinding {
                session_id: session_id.clone(),
                tab_id,
                pinned_at: now_ms().max(floor),
            };
            bindings.insert(session_id, binding.clone());
            (binding, previous)
        };

        if let Some(previous) = previous
            && previous.tab_id != tab_id
        {
            self.events.emit(&BridgeEvent::SessionUnpinned {
                session_id: previous.session_id,
                tab_id: previous.tab_id,
            });
        }

        debug!(session_id = %binding.session_id, tab_id = %tab_id, "Session pinned");
        self.events.emit(&BridgeEvent::SessionPinned {
            session_id: binding.session_id.clone(),
            tab_id,
        });

        binding
    }

    /// Removes the binding of `session_id`. Returns the tab it pointed to.
    pub fn unpin_tab(&self, session_id: &SessionId) -> Option<TabId> {
        let removed = self.bindings.lock().remove(session_id)?;

        debug!(session_id = %session_id, tab_id = %removed.tab_id, "Session unpinned");
        self.events.emit(&BridgeEvent::SessionUnpinned {
            session_id: removed.session_id,
            tab_id: removed.tab_id,
        });

        Some(removed.tab_id)
    }

    /// Returns the tab pinned by `session_id`.
    #[inline]
    #[must_use]
    pub fn get_pinned_tab(&self, session_id: &SessionId) -> Option<TabId> {
        self.bindings.lock().get(session_id).map(|b| b.tab_id)
    }

    /// Returns the full binding of `session_id`.
    #[inline]
    #[must_use]
    pub fn get_binding(&self, session_id: &SessionId) -> Option<SessionBinding> {
        self.bindings.lock().get(session_id).cloned()
    }

    /// Returns every session pinned to `tab_id`, sorted.
    #[must_use]
    pub fn get_sessions_for_tab(&self, tab_id: TabId) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .bindings
            .lock()
            .values()
            .filter(|b| b.tab_id == tab_id)
            .map(|b| b.session_id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Returns `true` if at least one session is pinned to `tab_id`.
    #[must_use]
    pub fn is_tab_pinned(&self, tab_id: TabId) -> bool {
        self.bindings.lock().values().any(|b| b.tab_id == tab_id)
    }

    /// Removes the binding of one session. Tab records are untouched.
    pub fn clear_session(&self, session_id: &SessionId) -> bool {
        self.unpin_tab(session_id).is_some()
    }

    /// Removes every binding. Tab records are untouched.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<SessionBinding> = self.bindings.lock().drain().map(|(_, b)| b).collect();

        for binding in &drained {
            self.events.emit(&BridgeEvent::SessionUnpinned {
                session_id: binding.session_id.clone(),
                tab_id: binding.tab_id,
            });
        }

        debug!(count = drained.len(), "Cleared all session bindings");
        drained.len()
    }

    /// Returns the number of bindings.
    #[inline]
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }
}

// ============================================================================
// TabRegistry - Activation
// ============================================================================

impl TabRegistry {
    /// Marks `tab_id` active.
    ///
    /// # Errors
    ///
    /// - [`Error::PortNotReserved`] if `port` is not reserved for `tab_id`
    /// - [`Error::TabAlreadyActive`] if the tab already has a record
    pub fn activate_tab(
        &self,
        tab_id: TabId,
        url: impl Into<String>,
        title: impl Into<String>,
        port: u16,
    ) -> Result<TabRecord> {
        if self.ports.port_for(tab_id) != Some(port) {
            return Err(Error::PortNotReserved { tab_id, port });
        }

        let url = url.into();
        let record = TabRecord {
            tab_id,
            resource_namespace: namespace::namespace_for(&url),
            url,
            title: title.into(),
            port,
            detected_capability: None,
            is_active: true,
            activated_at: now_ms(),
        };

        {
            let mut tabs = self.tabs.write();
            if tabs.contains_key(&tab_id) {
                return Err(Error::TabAlreadyActive { tab_id });
            }
            tabs.insert(tab_id, record.clone());
        }

        info!(
            tab_id = %tab_id,
            port,
            namespace = %record.resource_namespace,
            "Tab activated"
        );
        self.events.emit(&BridgeEvent::TabActivated {
            tab_id,
            url: record.url.clone(),
            port,
            namespace: record.resource_namespace.clone(),
        });

        Ok(record)
    }

    /// Waits for exclusive use of the activation sequence.
    ///
    /// Hold the guard from port reservation until [`Self::activate_tab`]
    /// returns.
    pub async fn lock_activation(&self) -> AsyncMutexGuard<'_, ()> {
        self.activation.lock().await
    }

    /// Marks `tab_id` inactive. Returns the removed record, if any.
    pub fn deactivate_tab(&self, tab_id: TabId) -> Option<TabRecord> {
        let removed = self.tabs.write().remove(&tab_id)?;

        info!(tab_id = %tab_id, "Tab deactivated");
        self.events.emit(&BridgeEvent::TabDeactivated { tab_id });

        Some(removed)
    }

    /// Returns the record of an active tab.
    #[inline]
    #[must_use]
    pub fn get_tab(&self, tab_id: TabId) -> Option<TabRecord> {
        self.tabs.read().get(&tab_id).cloned()
    }

    /// Returns `true` if `tab_id` is active.
    #[inline]
    #[must_use]
    pub fn is_active(&self, tab_id: TabId) -> bool {
        self.tabs.read().contains_key(&tab_id)
    }

    /// Returns all active tabs ordered by id.
    #[must_use]
    pub fn active_tabs(&self) -> Vec<TabRecord> {
        let mut tabs: Vec<TabRecord> = self.tabs.read().values().cloned().collect();
        tabs.sort_by_key(|t| t.tab_id);
        tabs
    }

    /// Returns the namespace root URI of an active tab.
    #[must_use]
    pub fn get_virtual_filesystem_uri(&self, tab_id: TabId) -> Option<String> {
        self.tabs.read().get(&tab_id).map(TabRecord::base_uri)
    }

    /// Records the framework detected on an active tab.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TabNotFound`] if the tab is not active.
    pub fn set_detected_capability(
        &self,
        tab_id: TabId,
        capability: Option<String>,
    ) -> Result<()> {
        let mut tabs = self.tabs.write();
        let record = tabs.get_mut(&tab_id).ok_or_else(|| Error::tab_not_found(tab_id))?;
        record.detected_capability = capability;
        Ok(())
    }

    /// Updates the title of an active tab.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TabNotFound`] if the tab is not active.
    pub fn update_title(&self, tab_id: TabId, title: impl Into<String>) -> Result<()> {
        let mut tabs = self.tabs.write();
        let record = tabs.get_mut(&tab_id).ok_or_else(|| Error::tab_not_found(tab_id))?;
        record.title = title.into();
        Ok(())
    }

    /// Picks the tab an operation should target.
    ///
    /// An explicit tab wins, then the session's pinned tab, then the only
    /// active tab when exactly one exists.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if a session was given but is not pinned
    ///   and no single active tab exists
    /// - [`Error::InvalidArgument`] if nothing identifies a tab
    pub fn resolve_tab(&self, session_id: Option<&SessionId>, explicit: Option<TabId>) -> Result<TabId> {
        if let Some(tab_id) = explicit {
            return Ok(tab_id);
        }

        if let Some(session_id) = session_id
            && let Some(tab_id) = self.get_pinned_tab(session_id)
        {
            return Ok(tab_id);
        }

        {
            let tabs = self.tabs.read();
            if tabs.len() == 1
                && let Some(&tab_id) = tabs.keys().next()
            {
                return Ok(tab_id);
            }
        }

        match session_id {
            Some(session_id) => Err(Error::session_not_found(session_id.clone())),
            None => Err(Error::invalid_argument(
                "tabId is required when no tab is pinned and several tabs are active",
            )),
        }
    }
}

/// Wall clock in milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::EventKind;

    fn tab(id: u32) -> TabId {
        TabId::new(id).expect("valid tab id")
    }

    fn registry() -> (TabRegistry, Arc<PortAllocator>, EventBus) {
        let events = EventBus::new();
        let ports = Arc::new(PortAllocator::default());
        (TabRegistry::new(Arc::clone(&ports), events.clone()), ports, events)
    }

    #[test]
    fn test_repin_replaces_binding() {
        let (registry, _, _) = registry();
        let s1 = SessionId::from("s1");

        registry.pin_tab(s1.clone(), tab(1));
        registry.pin_tab(s1.clone(), tab(2));

        assert_eq!(registry.get_pinned_tab(&s1), Some(tab(2)));
        assert!(!registry.is_tab_pinned(tab(1)));
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn test_pinned_at_non_decreasing() {
        let (registry, _, _) = registry();
        let s1 = SessionId::from("s1");

        let first = registry.pin_tab(s1.clone(), tab(1));
        let second = registry.pin_tab(s1, tab(2));
        assert!(second.pinned_at >= first.pinned_at);
    }

    #[test]
    fn test_is_tab_pinned_tracks_last_session() {
        let (registry, _, _) = registry();
        let a = SessionId::from("a");
        let b = SessionId::from("b");

        registry.pin_tab(a.clone(), tab(7));
        registry.pin_tab(b.clone(), tab(7));
        assert_eq!(registry.get_sessions_for_tab(tab(7)), vec![a.clone(), b.clone()]);

        registry.unpin_tab(&a);
        assert!(registry.is_tab_pinned(tab(7)));
        registry.unpin_tab(&b);
        assert!(!registry.is_tab_pinned(tab(7)));
    }

    #[test]
    fn test_unpin_unbound_session_is_noop() {
        let (registry, _, events) = registry();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        events.on(EventKind::SessionUnpinned, move |_| *h.lock() += 1);

        assert_eq!(registry.unpin_tab(&SessionId::from("ghost")), None);
        assert!(!registry.clear_session(&SessionId::from("ghost")));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_activate_requires_reserved_port() {
        let (registry, ports, _) = registry();

        let err = registry
            .activate_tab(tab(42), "http://localhost:3000", "App", 3101)
            .unwrap_err();
        assert!(matches!(err, Error::PortNotReserved { port: 3101, .. }));

        ports.reserve_port(tab(42), 3101).expect("reserve");
        registry
            .activate_tab(tab(42), "http://localhost:3000", "App", 3101)
            .expect("activate");
    }

    #[test]
    fn test_activate_scenario_and_deactivate() {
        let (registry, ports, _) = registry();
        ports.reserve_port(tab(42), 3101).expect("reserve");

        let record = registry
            .activate_tab(tab(42), "http://localhost:3000", "App", 3101)
            .expect("activate");
        assert_eq!(record.resource_namespace, "tab-localhost-3000");
        assert_eq!(
            registry.get_virtual_filesystem_uri(tab(42)).as_deref(),
            Some("browser://tab-localhost-3000/")
        );

        assert!(registry.deactivate_tab(tab(42)).is_some());
        assert_eq!(registry.get_virtual_filesystem_uri(tab(42)), None);
    }

    #[test]
    fn test_activate_twice_conflicts() {
        let (registry, ports, _) = registry();
        ports.reserve_port(tab(1), 3100).expect("reserve");
        registry.activate_tab(tab(1), "http://a.test", "A", 3100).expect("activate");

        let err = registry.activate_tab(tab(1), "http://a.test", "A", 3100).unwrap_err();
        assert!(matches!(err, Error::TabAlreadyActive { .. }));
    }

    #[test]
    fn test_deactivate_inactive_is_noop() {
        let (registry, _, events) = registry();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        events.on(EventKind::TabDeactivated, move |_| *h.lock() += 1);

        assert!(registry.deactivate_tab(tab(5)).is_none());
        assert!(registry.deactivate_tab(tab(5)).is_none());
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_pin_survives_deactivation() {
        let (registry, ports, _) = registry();
        let s = SessionId::from("ide");
        ports.reserve_port(tab(3), 3103).expect("reserve");
        registry.activate_tab(tab(3), "http://x.test", "X", 3103).expect("activate");
        registry.pin_tab(s.clone(), tab(3));

        registry.deactivate_tab(tab(3));
        assert_eq!(registry.get_pinned_tab(&s), Some(tab(3)));
        assert!(registry.get_tab(tab(3)).is_none());
    }

    #[test]
    fn test_clear_all_keeps_tabs() {
        let (registry, ports, _) = registry();
        ports.reserve_port(tab(1), 3100).expect("reserve");
        registry.activate_tab(tab(1), "http://a.test", "A", 3100).expect("activate");
        registry.pin_tab("a".into(), tab(1));
        registry.pin_tab("b".into(), tab(1));

        assert_eq!(registry.clear_all(), 2);
        assert_eq!(registry.binding_count(), 0);
        assert!(registry.is_active(tab(1)));
    }

    #[test]
    fn test_resolve_tab_precedence() {
        let (registry, ports, _) = registry();
        let s = SessionId::from("s");

        assert!(registry.resolve_tab(None, None).is_err());
        assert!(matches!(
            registry.resolve_tab(Some(&s), None),
            Err(Error::SessionNotFound { .. })
        ));

        ports.reserve_port(tab(1), 3100).expect("reserve");
        registry.activate_tab(tab(1), "http://a.test", "A", 3100).expect("activate");
        assert_eq!(registry.resolve_tab(None, None).expect("single"), tab(1));

        registry.pin_tab(s.clone(), tab(9));
        assert_eq!(registry.resolve_tab(Some(&s), None).expect("pinned"), tab(9));
        assert_eq!(registry.resolve_tab(Some(&s), Some(tab(4))).expect("explicit"), tab(4));
    }

    #[test]
    fn test_set_detected_capability() {
        let (registry, ports, _) = registry();
        assert!(registry.set_detected_capability(tab(1), Some("react".into())).is_err());

        ports.reserve_port(tab(1), 3100).expect("reserve");
        registry.activate_tab(tab(1), "http://a.test", "A", 3100).expect("activate");
        registry
            .set_detected_capability(tab(1), Some("react".into()))
            .expect("set");
        assert_eq!(
            registry.get_tab(tab(1)).and_then(|t| t.detected_capability),
            Some("react".to_string())
        );
    }
}
