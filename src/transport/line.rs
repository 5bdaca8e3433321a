//! Newline-delimited JSON transport.
//!
//! Used for the stdio channel to the AI client: one JSON document per line,
//! blank lines ignored.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::Result;

use super::frame::{FrameReader, FrameWriter};

// ============================================================================
// LineReader
// ============================================================================

/// Reads one frame per `\n`-terminated line.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: Vec::new(),
        }
    }
}

#[async_trait]
impl<R> FrameReader for LineReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            self.line.clear();
            if self.inner.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }

            let trimmed = self.line.trim_ascii();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_vec()));
            }
        }
    }
}

// ============================================================================
// LineWriter
// ============================================================================

/// Writes one frame per line.
#[derive(Debug)]
pub struct LineWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Wraps a byte sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }
}

#[async_trait]
impl<W> FrameWriter for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_skips_blank_lines() {
        let input: &[u8] = b"\n  \r\n{\"a\":1}\r\n\n{\"b\":2}";
        let mut reader = LineReader::new(input);

        assert_eq!(reader.read_frame().await.expect("read"), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(reader.read_frame().await.expect("read"), Some(b"{\"b\":2}".to_vec()));
        assert_eq!(reader.read_frame().await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_reader_joins_split_chunks() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"method\":")
            .read(b"\"ping\"}\n{\"id\"")
            .read(b":1}\n")
            .build();
        let mut reader = LineReader::new(mock);

        assert_eq!(
            reader.read_frame().await.expect("read"),
            Some(b"{\"method\":\"ping\"}".to_vec())
        );
        assert_eq!(reader.read_frame().await.expect("read"), Some(b"{\"id\":1}".to_vec()));
        assert_eq!(reader.read_frame().await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_writer_appends_single_newline() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut writer = LineWriter::new(client);

        writer.write_frame(b"{\"a\":1}").await.expect("write");
        writer.write_frame(b"{\"b\":2}").await.expect("write");
        writer.close().await.expect("close");

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .expect("read");
        assert_eq!(out, b"{\"a\":1}\n{\"b\":2}\n");
    }
}
