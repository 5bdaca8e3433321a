//! Length-prefixed transport for the native-messaging channel.
//!
//! Outbound frames are gzip-compressed above a size threshold and coalesced
//! for a short window before being written.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::error::Result;

use super::codec::{self, DEFAULT_COMPRESSION_THRESHOLD, FrameDecoder};
use super::frame::{FrameReader, FrameWriter};

// ============================================================================
// Constants
// ============================================================================

/// Default coalescing window.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(10);

/// Read chunk size.
const READ_CHUNK: usize = 8 * 1024;

// ============================================================================
// FramingOptions
// ============================================================================

/// Writer tuning for the length-prefixed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramingOptions {
    /// JSON documents longer than this many bytes are gzip-compressed.
    pub compression_threshold: usize,
    /// How long written frames may be held before flushing.
    #[serde(with = "duration_ms")]
    pub coalesce_window: Duration,
}

impl Default for FramingOptions {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            coalesce_window: DEFAULT_COALESCE_WINDOW,
        }
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// LengthPrefixedReader
// ============================================================================

/// Reads length-prefixed frames, inflating gzip payloads.
#[derive(Debug)]
pub struct LengthPrefixedReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LengthPrefixedReader<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, codec::MAX_FRAME_LEN)
    }

    /// Wraps a byte stream, limiting both wire and inflated frame size.
    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::with_max_frame_len(max_frame_len),
            chunk: vec![0; READ_CHUNK],
        }
    }
}

#[async_trait]
impl<R> FrameReader for LengthPrefixedReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            while let Some(payload) = self.decoder.next_frame()? {
                let compressed = payload.is_compressed();
                match payload.into_json(self.decoder.max_frame_len()) {
                    Ok(json) => {
                        trace!(len = json.len(), compressed, "Frame decoded");
                        return Ok(Some(json));
                    }
                    Err(e) => warn!(error = %e, "Dropping frame with undecodable gzip payload"),
                }
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered_len() > 0 {
                    warn!(
                        buffered = self.decoder.buffered_len(),
                        "Stream ended inside a frame"
                    );
                }
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

// ============================================================================
// LengthPrefixedWriter
// ============================================================================

/// Writes length-prefixed frames into a buffer drained on flush.
#[derive(Debug)]
pub struct LengthPrefixedWriter<W> {
    inner: W,
    pending: Vec<u8>,
    options: FramingOptions,
}

impl<W: AsyncWrite + Unpin> LengthPrefixedWriter<W> {
    /// Wraps a byte sink.
    pub fn new(inner: W, options: FramingOptions) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            options,
        }
    }
}

#[async_trait]
impl<W> FrameWriter for LengthPrefixedWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        codec::encode_frame(frame, self.options.compression_threshold, &mut self.pending)
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            trace!(bytes = self.pending.len(), "Flushing frames");
            self.inner.write_all(&self.pending).await?;
            self.pending.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    fn coalesce_window(&self) -> Duration {
        self.options.coalesce_window
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use crate::error::Error;

    #[tokio::test]
    async fn test_round_trip_with_compression() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = LengthPrefixedWriter::new(client, FramingOptions::default());
        let mut reader = LengthPrefixedReader::new(server);

        let small = br#"{"jsonrpc":"2.0","method":"ping"}"#.to_vec();
        let large = format!(r#"{{"blob":"{}"}}"#, "a".repeat(5000)).into_bytes();

        writer.write_frame(&small).await.expect("write");
        writer.write_frame(&large).await.expect("write");
        assert!(writer.pending.len() < small.len() + large.len());
        writer.flush().await.expect("flush");

        assert_eq!(reader.read_frame().await.expect("read"), Some(small));
        assert_eq!(reader.read_frame().await.expect("read"), Some(large));
    }

    #[tokio::test]
    async fn test_nothing_written_before_flush() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = LengthPrefixedWriter::new(client, FramingOptions::default());
        writer.write_frame(b"{}").await.expect("write");

        let mut reader = LengthPrefixedReader::new(server);
        let pending = tokio::time::timeout(Duration::from_millis(20), reader.read_frame()).await;
        assert!(pending.is_err());

        writer.flush().await.expect("flush");
        assert_eq!(reader.read_frame().await.expect("read"), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_skipped() {
        let mut wire = Vec::new();
        let bogus = [0x1f, 0x8b, 0x00, 0x01];
        wire.extend_from_slice(&(bogus.len() as u32).to_le_bytes());
        wire.extend_from_slice(&bogus);
        codec::encode_frame(b"{\"ok\":true}", 1024, &mut wire).expect("encode");

        let mut reader = LengthPrefixedReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().await.expect("read"), Some(b"{\"ok\":true}".to_vec()));
        assert_eq!(reader.read_frame().await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_inflation_bomb_is_skipped() {
        let blanks = vec![b' '; 1024 * 1024];
        let mut wire = Vec::new();
        codec::encode_frame(&blanks, 1024, &mut wire).expect("encode");
        assert!(wire.len() < 64 * 1024);
        codec::encode_frame(b"{\"ok\":true}", 1024, &mut wire).expect("encode");

        let mut reader = LengthPrefixedReader::with_max_frame_len(Cursor::new(wire), 64 * 1024);
        assert_eq!(reader.read_frame().await.expect("read"), Some(b"{\"ok\":true}".to_vec()));
        assert_eq!(reader.read_frame().await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_stream() {
        let wire = u32::MAX.to_le_bytes().to_vec();
        let mut reader = LengthPrefixedReader::new(Cursor::new(wire));

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }
}
