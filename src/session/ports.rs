//! Per-tab port allocation.
//!
//! Ports are drawn from a primary range and, once that is exhausted, from a
//! secondary range. Each candidate is probed with a real bind-and-release
//! because the reservation table only knows this process's bookkeeping.
//!
//! The probe is advisory. [`PortAllocator::reserve_port`] is the point where
//! conflicts are decided, so two callers that probe the same free port
//! concurrently cannot both reserve it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::identifiers::TabId;

// ============================================================================
// Constants
// ============================================================================

/// Default primary port range.
pub const DEFAULT_PRIMARY_RANGE: PortRange = PortRange::new(3100, 3199);

/// Default secondary port range.
pub const DEFAULT_SECONDARY_RANGE: PortRange = PortRange::new(9100, 9199);

/// Address used for availability probes.
const PROBE_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// ============================================================================
// PortRange
// ============================================================================

/// Inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port (inclusive).
    pub start: u16,
    /// Last port (inclusive).
    pub end: u16,
}

impl PortRange {
    /// Creates a range; `start > end` yields an empty range.
    #[inline]
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Returns the ports in ascending order.
    #[inline]
    #[must_use]
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Returns `true` if `port` lies in the range.
    #[inline]
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    /// Number of ports in the range.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    /// Returns `true` if the range holds no ports.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ============================================================================
// ReservationTable
// ============================================================================

/// Both directions of the `tab <-> port` mapping, kept in lockstep.
#[derive(Debug, Default)]
struct ReservationTable {
    by_tab: FxHashMap<TabId, u16>,
    by_port: FxHashMap<u16, TabId>,
}

impl ReservationTable {
    fn remove_tab(&mut self, tab_id: TabId) -> Option<u16> {
        let port = self.by_tab.remove(&tab_id)?;
        self.by_port.remove(&port);
        Some(port)
    }
}

// ============================================================================
// PortAllocator
// ============================================================================

/// Hands out unique local ports to tabs.
///
/// Thread-safe; all table mutations go through one lock.
pub struct PortAllocator {
    /// Preferred range.
    primary: PortRange,
    /// Fallback range.
    secondary: PortRange,
    /// Reservation table.
    table: Mutex<ReservationTable>,
    /// Optional event sink for allocation events.
    events: Option<EventBus>,
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("reserved", &self.reserved_count())
            .finish_non_exhaustive()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PRIMARY_RANGE, DEFAULT_SECONDARY_RANGE)
    }
}

impl PortAllocator {
    /// Creates an allocator over the given ranges.
    #[must_use]
    pub fn new(primary: PortRange, secondary: PortRange) -> Self {
        Self {
            primary,
            secondary,
            table: Mutex::new(ReservationTable::default()),
            events: None,
        }
    }

    /// Publishes `PortAllocated` / `PortReleased` on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the primary range.
    #[inline]
    #[must_use]
    pub fn primary(&self) -> PortRange {
        self.primary
    }

    /// Returns the secondary range.
    #[inline]
    #[must_use]
    pub fn secondary(&self) -> PortRange {
        self.secondary
    }

    /// Finds a port that is neither reserved here nor bound by anyone else.
    ///
    /// Scans the primary range in ascending order, then the secondary range.
    /// The port is not reserved by this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailablePort`] if both ranges are exhausted.
    pub async fn find_available_port(&self) -> Result<u16> {
        for range in [self.primary, self.secondary] {
            for port in range.ports() {
                if self.is_reserved(port) {
                    continue;
                }
                if probe(port).await {
                    trace!(port, "Port probe succeeded");
                    return Ok(port);
                }
                trace!(port, "Port busy at OS level");
            }
            debug!(%range, "Port range exhausted");
        }

        Err(Error::NoAvailablePort {
            primary_start: self.primary.start,
            primary_end: self.primary.end,
            secondary_start: self.secondary.start,
            secondary_end: self.secondary.end,
        })
    }

    /// Reserves `port` for `tab_id`.
    ///
    /// Reserving the port a tab already holds is a no-op. A tab holding a
    /// different port has that port released first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortAlreadyReserved`] if another tab holds `port`.
    pub fn reserve_port(&self, tab_id: TabId, port: u16) -> Result<()> {
        let released = {
            let mut table = self.table.lock();

            match table.by_port.get(&port) {
                Some(&holder) if holder == tab_id => return Ok(()),
                Some(&holder) => return Err(Error::PortAlreadyReserved { port, holder }),
                None => {}
            }

            let released = table.remove_tab(tab_id);
            table.by_tab.insert(tab_id, port);
            table.by_port.insert(port, tab_id);
            released
        };

        if let Some(old) = released {
            debug!(tab_id = %tab_id, port = old, "Released previous port");
            self.publish(BridgeEvent::PortReleased { tab_id, port: old });
        }
        debug!(tab_id = %tab_id, port, "Port reserved");
        self.publish(BridgeEvent::PortAllocated { tab_id, port });

        Ok(())
    }

    /// Finds and reserves a port for `tab_id`.
    ///
    /// Returns the tab's existing port if it already holds one. Retries when
    /// a concurrent caller reserves the probed port first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailablePort`] if both ranges are exhausted.
    pub async fn allocate(&self, tab_id: TabId) -> Result<u16> {
        if let Some(port) = self.port_for(tab_id) {
            return Ok(port);
        }

        let max_attempts = self.primary.len() + self.secondary.len();
        for _ in 0..max_attempts.max(1) {
            let port = self.find_available_port().await?;
            match self.reserve_port(tab_id, port) {
                Ok(()) => return Ok(port),
                Err(Error::PortAlreadyReserved { .. }) => {
                    debug!(tab_id = %tab_id, port, "Lost reservation race, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoAvailablePort {
            primary_start: self.primary.start,
            primary_end: self.primary.end,
            secondary_start: self.secondary.start,
            secondary_end: self.secondary.end,
        })
    }

    /// Releases the port held by `tab_id`, if any.
    pub fn release_port(&self, tab_id: TabId) -> Option<u16> {
        let released = self.table.lock().remove_tab(tab_id);

        if let Some(port) = released {
            debug!(tab_id = %tab_id, port, "Port released");
            self.publish(BridgeEvent::PortReleased { tab_id, port });
        }

        released
    }

    /// Releases `port` only if it is still the port reserved for `tab_id`.
    ///
    /// Returns `true` if a reservation was removed.
    pub fn release_if(&self, tab_id: TabId, port: u16) -> bool {
        let released = {
            let mut table = self.table.lock();
            if table.by_tab.get(&tab_id) == Some(&port) {
                table.remove_tab(tab_id).is_some()
            } else {
                false
            }
        };

        if released {
            debug!(tab_id = %tab_id, port, "Port released");
            self.publish(BridgeEvent::PortReleased { tab_id, port });
        }

        released
    }

    /// Returns the port reserved for `tab_id`.
    #[inline]
    #[must_use]
    pub fn port_for(&self, tab_id: TabId) -> Option<u16> {
        self.table.lock().by_tab.get(&tab_id).copied()
    }

    /// Returns the tab holding `port`.
    #[inline]
    #[must_use]
    pub fn tab_for(&self, port: u16) -> Option<TabId> {
        self.table.lock().by_port.get(&port).copied()
    }

    /// Returns `true` if `port` is reserved by any tab.
    #[inline]
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.table.lock().by_port.contains_key(&port)
    }

    /// Returns the number of reserved ports.
    #[inline]
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.table.lock().by_tab.len()
    }

    fn publish(&self, event: BridgeEvent) {
        if let Some(events) = &self.events {
            events.emit(&event);
        }
    }
}

/// Binds and immediately releases `port` on localhost.
async fn probe(port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(PROBE_IP, port))
        .await
        .is_ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener as StdListener;
    use std::sync::Arc;

    use crate::events::EventKind;

    fn tab(id: u32) -> TabId {
        TabId::new(id).expect("valid tab id")
    }

    /// Holds a port at OS level for the duration of a test.
    fn occupy() -> (StdListener, u16) {
        let listener = StdListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    #[test]
    fn test_reserve_conflict_until_release() {
        let ports = PortAllocator::default();

        ports.reserve_port(tab(1), 3150).expect("first reservation");
        let err = ports.reserve_port(tab(2), 3150).unwrap_err();
        assert!(matches!(err, Error::PortAlreadyReserved { port: 3150, .. }));

        ports.release_port(tab(1));
        ports.reserve_port(tab(2), 3150).expect("free after release");
        assert_eq!(ports.tab_for(3150), Some(tab(2)));
    }

    #[test]
    fn test_reserve_same_port_same_tab_is_noop() {
        let ports = PortAllocator::default();
        ports.reserve_port(tab(1), 3150).expect("reserve");
        ports.reserve_port(tab(1), 3150).expect("idempotent");
        assert_eq!(ports.reserved_count(), 1);
    }

    #[test]
    fn test_reserve_new_port_releases_old() {
        let ports = PortAllocator::default();
        ports.reserve_port(tab(1), 3150).expect("reserve");
        ports.reserve_port(tab(1), 3151).expect("move");

        assert_eq!(ports.port_for(tab(1)), Some(3151));
        assert!(!ports.is_reserved(3150));
        assert_eq!(ports.reserved_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = PortAllocator::default();
        assert_eq!(ports.release_port(tab(9)), None);
        ports.reserve_port(tab(9), 3160).expect("reserve");
        assert_eq!(ports.release_port(tab(9)), Some(3160));
        assert_eq!(ports.release_port(tab(9)), None);
        assert!(!ports.is_reserved(3160));
    }

    #[test]
    fn test_release_if_ignores_stale_port() {
        let ports = PortAllocator::default();
        ports.reserve_port(tab(1), 3150).expect("reserve");
        ports.reserve_port(tab(1), 3151).expect("move");

        assert!(!ports.release_if(tab(1), 3150));
        assert_eq!(ports.port_for(tab(1)), Some(3151));

        assert!(ports.release_if(tab(1), 3151));
        assert_eq!(ports.port_for(tab(1)), None);
        assert!(!ports.release_if(tab(1), 3151));
    }

    #[tokio::test]
    async fn test_find_skips_reserved_ports() {
        let ports = PortAllocator::new(PortRange::new(45100, 45110), PortRange::new(45111, 45120));
        ports.reserve_port(tab(1), 45100).expect("reserve");

        match ports.find_available_port().await {
            Ok(port) => assert_ne!(port, 45100),
            Err(e) => assert!(matches!(e, Error::NoAvailablePort { .. })),
        }
    }

    #[tokio::test]
    async fn test_find_falls_back_to_secondary() {
        let (_held, busy) = occupy();
        let (free_listener, free) = occupy();
        drop(free_listener);

        let ports = PortAllocator::new(PortRange::new(busy, busy), PortRange::new(free, free));
        assert_eq!(ports.find_available_port().await.expect("secondary"), free);
    }

    #[tokio::test]
    async fn test_find_exhausted() {
        let (_held, busy) = occupy();
        let ports = PortAllocator::new(PortRange::new(busy, busy), PortRange::new(busy, busy));

        let err = ports.find_available_port().await.unwrap_err();
        assert!(matches!(err, Error::NoAvailablePort { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_allocate_reuses_existing_port() {
        let (listener, free) = occupy();
        drop(listener);

        let ports = PortAllocator::new(PortRange::new(free, free), PortRange::new(free, free));
        let first = ports.allocate(tab(1)).await.expect("allocate");
        let second = ports.allocate(tab(1)).await.expect("allocate again");
        assert_eq!(first, second);

        let err = ports.allocate(tab(2)).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailablePort { .. }));
    }

    #[test]
    fn test_events_published() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::PortAllocated, EventKind::PortReleased] {
            let seen = Arc::clone(&seen);
            bus.on(kind, move |e| seen.lock().push(e.clone()));
        }

        let ports = PortAllocator::default().with_events(bus);
        ports.reserve_port(tab(1), 3100).expect("reserve");
        ports.release_port(tab(1));

        assert_eq!(
            *seen.lock(),
            vec![
                BridgeEvent::PortAllocated { tab_id: tab(1), port: 3100 },
                BridgeEvent::PortReleased { tab_id: tab(1), port: 3100 },
            ]
        );
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::new(3100, 3102);
        assert_eq!(range.len(), 3);
        assert!(range.contains(3101));
        assert!(!range.contains(3103));
        assert!(PortRange::new(5, 1).is_empty());
        assert_eq!(range.to_string(), "3100-3102");
    }
}
