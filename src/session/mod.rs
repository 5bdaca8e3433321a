//! Port allocation and session-to-tab multiplexing.

// ============================================================================
// Submodules
// ============================================================================

/// Loopback port reservations per tab.
pub mod ports;

/// Session bindings and active tab records.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use ports::{DEFAULT_PRIMARY_RANGE, DEFAULT_SECONDARY_RANGE, PortAllocator, PortRange};
pub use registry::{SessionBinding, TabRecord, TabRegistry};
