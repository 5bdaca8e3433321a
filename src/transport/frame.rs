//! Frame I/O seam shared by every transport.
//!
//! A transport is a [`FrameReader`] yielding one JSON document per frame and
//! a [`FrameWriter`] accepting one JSON document per frame. The
//! [`Connection`](super::Connection) event loop owns the writer; the reader
//! runs on its own task.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

// ============================================================================
// Traits
// ============================================================================

/// Inbound half of a transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Reads the next JSON document.
    ///
    /// Returns `Ok(None)` at end of stream. An error ends the stream.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Queues one JSON document. May buffer until [`flush`](Self::flush).
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Pushes buffered frames to the peer.
    async fn flush(&mut self) -> Result<()>;

    /// Flushes and closes the outbound direction.
    async fn close(&mut self) -> Result<()> {
        self.flush().await
    }

    /// How long queued frames may wait before a flush.
    ///
    /// Zero flushes after every frame.
    fn coalesce_window(&self) -> Duration {
        Duration::ZERO
    }
}
