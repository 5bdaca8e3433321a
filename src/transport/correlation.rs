//! Request/response correlation.
//!
//! Each outbound request registers a one-shot responder under its id. The
//! first of (matching response, timeout, transport close) consumes the
//! entry; anything arriving afterwards finds no entry and is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::Response;

// ============================================================================
// Constants
// ============================================================================

/// Default time to wait for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum pending requests before rejecting new ones.
pub const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Delivers the outcome of one pending request.
type Responder = oneshot::Sender<Result<Response>>;

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, Responder>;

// ============================================================================
// Correlator
// ============================================================================

/// Pending-request table of one connection.
pub struct Correlator {
    next_id: AtomicI64,
    pending: Mutex<CorrelationMap>,
    max_pending: usize,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending.lock().len())
            .field("max_pending", &self.max_pending)
            .finish_non_exhaustive()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Creates an empty table with the default pending limit.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_pending(MAX_PENDING_REQUESTS)
    }

    /// Creates an empty table with a custom pending limit.
    #[inline]
    #[must_use]
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(CorrelationMap::default()),
            max_pending,
        }
    }

    /// Returns a fresh numeric id.
    #[inline]
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a pending request.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateRequestId`] if `request_id` is already pending
    /// - [`Error::Protocol`] if the pending limit is reached
    pub fn register(&self, request_id: RequestId) -> Result<oneshot::Receiver<Result<Response>>> {
        let mut pending = self.pending.lock();

        if pending.contains_key(&request_id) {
            return Err(Error::DuplicateRequestId { request_id });
        }
        self.check_capacity(&pending)?;

        let (tx, rx) = oneshot::channel();
        pending.insert(request_id, tx);
        Ok(rx)
    }

    /// Registers a pending request under a generated id.
    ///
    /// Generated ids skip any id a caller already registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the pending limit is reached.
    pub fn register_next(&self) -> Result<(RequestId, oneshot::Receiver<Result<Response>>)> {
        let mut pending = self.pending.lock();
        self.check_capacity(&pending)?;

        let request_id = loop {
            let id = self.next_id();
            if !pending.contains_key(&id) {
                break id;
            }
        };

        let (tx, rx) = oneshot::channel();
        pending.insert(request_id.clone(), tx);
        Ok((request_id, rx))
    }

    fn check_capacity(&self, pending: &CorrelationMap) -> Result<()> {
        if pending.len() < self.max_pending {
            return Ok(());
        }

        warn!(
            pending = pending.len(),
            max = self.max_pending,
            "Too many pending requests"
        );
        Err(Error::protocol(format!(
            "Too many pending requests: {}/{}",
            pending.len(),
            self.max_pending
        )))
    }

    /// Completes the entry matching `response`.
    ///
    /// Returns `false` when no entry matches (unknown, timed out or
    /// already completed).
    pub fn resolve(&self, response: Response) -> bool {
        let Some(id) = response.id.as_ref() else {
            return false;
        };
        let Some(tx) = self.pending.lock().remove(id) else {
            return false;
        };

        // Receiver gone means the caller stopped waiting.
        let _ = tx.send(Ok(response));
        true
    }

    /// Drops the entry for `request_id`. Returns `false` if absent.
    pub fn remove(&self, request_id: &RequestId) -> bool {
        self.pending.lock().remove(request_id).is_some()
    }

    /// Fails every pending entry with [`Error::ConnectionClosed`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Responder> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();

        for tx in drained {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on close");
        }
        count
    }

    /// Returns the number of pending requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_REQUEST_TIMEOUT.as_secs(), 30);
        assert_eq!(MAX_PENDING_REQUESTS, 100);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let correlator = Correlator::new();
        let a = correlator.next_id();
        let b = correlator.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_next_skips_pending_ids() {
        let correlator = Correlator::new();
        let _caller = correlator.register(RequestId::Number(1)).expect("register");

        let (id, _rx) = correlator.register_next().expect("register next");
        assert_eq!(id, RequestId::Number(2));
        assert_eq!(correlator.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_responder_is_channel_closed() {
        let correlator = Correlator::new();
        let rx = correlator.register(RequestId::from("x")).expect("register");
        assert!(correlator.remove(&RequestId::from("x")));

        let err: Error = rx.await.unwrap_err().into();
        assert!(matches!(err, Error::ChannelClosed(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let correlator = Correlator::new();
        let _rx = correlator.register(RequestId::from("a")).expect("register");

        let err = correlator.register(RequestId::from("a")).unwrap_err();
        assert!(matches!(err, Error::DuplicateRequestId { .. }));
    }

    #[test]
    fn test_pending_limit() {
        let correlator = Correlator::with_max_pending(2);
        let _a = correlator.register(RequestId::Number(1)).expect("register");
        let _b = correlator.register(RequestId::Number(2)).expect("register");

        assert!(matches!(
            correlator.register(RequestId::Number(3)),
            Err(Error::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_reverse_order_not_cross_wired() {
        let correlator = Correlator::new();
        let rx1 = correlator.register(RequestId::Number(1)).expect("register");
        let rx2 = correlator.register(RequestId::Number(2)).expect("register");

        assert!(correlator.resolve(Response::success(RequestId::Number(2), json!("two"))));
        assert!(correlator.resolve(Response::success(RequestId::Number(1), json!("one"))));

        let r1 = rx1.await.expect("recv").expect("ok").into_result().expect("result");
        let r2 = rx2.await.expect("recv").expect("ok").into_result().expect("result");
        assert_eq!(r1, json!("one"));
        assert_eq!(r2, json!("two"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_late_response_dropped() {
        let correlator = Correlator::new();
        let _rx = correlator.register(RequestId::Number(7)).expect("register");

        assert!(correlator.remove(&RequestId::Number(7)));
        assert!(!correlator.resolve(Response::success(RequestId::Number(7), json!(null))));
        assert!(!correlator.remove(&RequestId::Number(7)));
    }

    #[tokio::test]
    async fn test_fail_all_closes_pending() {
        let correlator = Correlator::new();
        let rx = correlator.register(RequestId::Number(1)).expect("register");

        assert_eq!(correlator.fail_all(), 1);
        assert!(matches!(rx.await.expect("recv"), Err(Error::ConnectionClosed)));
    }
}
