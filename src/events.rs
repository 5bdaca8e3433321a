//! In-process publish/subscribe for bridge events.
//!
//! Registry mutations (tab activated, port reserved, session pinned) are
//! published here so observers such as the resource mapper and logging do
//! not have to be wired into the registries themselves.
//!
//! # Delivery
//!
//! - [`EventBus::emit`] calls every current listener of the event's
//!   [`EventKind`] synchronously, in subscription order.
//! - A panicking listener is caught and logged; later listeners still run.
//! - [`EventBus::once`] listeners are removed before their first delivery.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let sub = bus.on(EventKind::TabActivated, |event| {
//!     tracing::info!(?event, "tab up");
//! });
//! bus.emit(&BridgeEvent::TabDeactivated { tab_id });
//! sub.unsubscribe();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::identifiers::{PeerId, SessionId, SubscriptionId, TabId};
use crate::transport::reconnect::ConnectionState;

// ============================================================================
// EventKind
// ============================================================================

/// Event name used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A tab record was created.
    TabActivated,
    /// A tab record was removed.
    TabDeactivated,
    /// A port was reserved for a tab.
    PortAllocated,
    /// A tab's port reservation was dropped.
    PortReleased,
    /// A session was bound to a tab.
    SessionPinned,
    /// A session binding was removed.
    SessionUnpinned,
    /// A socket peer connected to the server.
    PeerConnected,
    /// A socket peer went away.
    PeerDisconnected,
    /// The reconnecting client changed state.
    ConnectionStateChanged,
    /// The reconnecting client gave up.
    ReconnectFailed,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::TabActivated,
        Self::TabDeactivated,
        Self::PortAllocated,
        Self::PortReleased,
        Self::SessionPinned,
        Self::SessionUnpinned,
        Self::PeerConnected,
        Self::PeerDisconnected,
        Self::ConnectionStateChanged,
        Self::ReconnectFailed,
    ];
}

// ============================================================================
// BridgeEvent
// ============================================================================

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A tab became active.
    TabActivated {
        /// Activated tab.
        tab_id: TabId,
        /// Tab URL at activation.
        url: String,
        /// Reserved port.
        port: u16,
        /// Derived resource namespace.
        namespace: String,
    },
    /// A tab became inactive.
    TabDeactivated {
        /// Deactivated tab.
        tab_id: TabId,
    },
    /// A port was reserved.
    PortAllocated {
        /// Holder.
        tab_id: TabId,
        /// Reserved port.
        port: u16,
    },
    /// A reservation was released.
    PortReleased {
        /// Former holder.
        tab_id: TabId,
        /// Released port.
        port: u16,
    },
    /// A session was pinned.
    SessionPinned {
        /// Session.
        session_id: SessionId,
        /// Pinned tab.
        tab_id: TabId,
    },
    /// A session was unpinned.
    SessionUnpinned {
        /// Session.
        session_id: SessionId,
        /// Previously pinned tab.
        tab_id: TabId,
    },
    /// A socket peer connected.
    PeerConnected {
        /// Peer.
        peer_id: PeerId,
    },
    /// A socket peer disconnected.
    PeerDisconnected {
        /// Peer.
        peer_id: PeerId,
    },
    /// Reconnecting client state change.
    ConnectionStateChanged {
        /// New state.
        state: ConnectionState,
    },
    /// Reconnecting client halted.
    ReconnectFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl BridgeEvent {
    /// Returns the subscription key of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TabActivated { .. } => EventKind::TabActivated,
            Self::TabDeactivated { .. } => EventKind::TabDeactivated,
            Self::PortAllocated { .. } => EventKind::PortAllocated,
            Self::PortReleased { .. } => EventKind::PortReleased,
            Self::SessionPinned { .. } => EventKind::SessionPinned,
            Self::SessionUnpinned { .. } => EventKind::SessionUnpinned,
            Self::PeerConnected { .. } => EventKind::PeerConnected,
            Self::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Listener callback.
pub type Listener = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

struct Entry {
    id: SubscriptionId,
    once: bool,
    listener: Listener,
}

type ListenerMap = FxHashMap<EventKind, Vec<Entry>>;

// ============================================================================
// EventBus
// ============================================================================

/// Publish/subscribe hub keyed by [`EventKind`].
///
/// Cloning is cheap; clones share listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<ListenerMap>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let total: usize = listeners.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("listeners", &total)
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener), false)
    }

    /// Subscribes to the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener), true)
    }

    /// Delivers `event` to the current listeners of its kind.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &BridgeEvent) -> usize {
        let kind = event.kind();

        // Snapshot outside the lock so listeners may subscribe or emit.
        let targets: Vec<(SubscriptionId, Listener)> = {
            let mut listeners = self.listeners.lock();
            let Some(entries) = listeners.get_mut(&kind) else {
                return 0;
            };
            let targets = entries
                .iter()
                .map(|e| (e.id, Arc::clone(&e.listener)))
                .collect();
            entries.retain(|e| !e.once);
            targets
        };

        trace!(?kind, listeners = targets.len(), "Emitting event");

        for (id, listener) in &targets {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(?kind, subscription = %id, "Event listener panicked");
            }
        }

        targets.len()
    }

    /// Removes all listeners of `kind`, or of every kind when `None`.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut listeners = self.listeners.lock();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }

    /// Returns the number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    fn subscribe(&self, kind: EventKind, listener: Listener, once: bool) -> Subscription {
        let id = SubscriptionId::next();
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push(Entry { id, once, listener });

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            kind,
            id,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    listeners: Weak<Mutex<ListenerMap>>,
    kind: EventKind,
    id: SubscriptionId,
}

impl Subscription {
    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(listeners) = self.listeners.upgrade() else {
            return false;
        };
        let mut listeners = listeners.lock();
        let Some(entries) = listeners.get_mut(&self.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != self.id);
        before != entries.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tab(id: u32) -> TabId {
        TabId::new(id).expect("valid tab id")
    }

    #[test]
    fn test_emit_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.on(EventKind::TabDeactivated, move |_| order.lock().push(n));
        }

        let delivered = bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(1) });
        assert_eq!(delivered, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_emit_only_matching_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on(EventKind::PortAllocated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(1) });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.on(EventKind::TabDeactivated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.clone().unsubscribe());
        assert!(!sub.unsubscribe());
        bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(1) });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_once_delivers_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.once(EventKind::TabDeactivated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(1) });
        bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(1) });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::TabDeactivated), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::TabDeactivated, |_| panic!("listener failure"));
        let h = Arc::clone(&hits);
        bus.on(EventKind::TabDeactivated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(1) });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new();
        bus.on(EventKind::TabActivated, |_| {});
        bus.on(EventKind::TabDeactivated, |_| {});

        bus.remove_all_listeners(Some(EventKind::TabActivated));
        assert_eq!(bus.listener_count(EventKind::TabActivated), 0);
        assert_eq!(bus.listener_count(EventKind::TabDeactivated), 1);

        bus.remove_all_listeners(None);
        assert_eq!(bus.listener_count(EventKind::TabDeactivated), 0);
    }

    #[test]
    fn test_listener_may_emit_reentrantly() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        bus.on(EventKind::TabActivated, move |_| {
            inner_bus.emit(&BridgeEvent::TabDeactivated { tab_id: tab(2) });
        });
        let h = Arc::clone(&hits);
        bus.on(EventKind::TabDeactivated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&BridgeEvent::TabActivated {
            tab_id: tab(2),
            url: "http://localhost:3000".into(),
            port: 3100,
            namespace: "tab-localhost-3000".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
