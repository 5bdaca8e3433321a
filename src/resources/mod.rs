//! Virtual resources exposed per browser tab.
//!
//! Every active tab gets four resources under its namespace:
//!
//! | URI suffix | MIME |
//! |------------|------|
//! | `dom/html` | `text/html` |
//! | `console/logs` | `application/json` |
//! | `network/requests` | `application/json` |
//! | `metadata/frameworks` | `application/json` |

// ============================================================================
// Submodules
// ============================================================================

/// Snapshot storage and descriptor creation.
pub mod mapper;

/// Namespace and base URI derivation.
pub mod namespace;

// ============================================================================
// Re-exports
// ============================================================================

pub use mapper::{ConsoleEntry, ConsoleLevel, MAX_SNAPSHOT_ENTRIES, NetworkEntry, ResourceMapper};
pub use namespace::{RESOURCE_SCHEME, base_uri, namespace_for};
