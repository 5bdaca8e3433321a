//! Length-prefixed frame codec.
//!
//! Wire format: a 4-byte little-endian `u32` length followed by that many
//! payload bytes. A payload starting with the gzip magic `1f 8b` is a
//! gzip stream wrapping the JSON document; anything else is plain JSON.

// ============================================================================
// Imports
// ============================================================================

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// JSON documents longer than this are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Largest accepted declared frame length (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Leading bytes of every gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ============================================================================
// Priority
// ============================================================================

/// Write urgency of an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    /// May wait for the coalescing window.
    #[default]
    Normal,
    /// Flushes the writer, together with anything already queued.
    Immediate,
}

// ============================================================================
// Payload
// ============================================================================

/// A frame body, classified by its leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 JSON.
    Plain(Vec<u8>),
    /// Gzip stream of UTF-8 JSON.
    Compressed(Vec<u8>),
}

impl Payload {
    /// Classifies raw frame bytes.
    #[must_use]
    pub fn classify(bytes: Vec<u8>) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Self::Compressed(bytes)
        } else {
            Self::Plain(bytes)
        }
    }

    /// Wraps a JSON document, compressing it when longer than `threshold`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if compression fails.
    pub fn encode(json: Vec<u8>, threshold: usize) -> Result<Self> {
        if json.len() <= threshold {
            return Ok(Self::Plain(json));
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
        encoder.write_all(&json)?;
        Ok(Self::Compressed(encoder.finish()?))
    }

    /// Returns `true` for a gzip payload.
    #[inline]
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// Returns the bytes as they appear on the wire.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Plain(bytes) | Self::Compressed(bytes) => bytes,
        }
    }

    /// Returns the JSON document, decompressing if needed.
    ///
    /// Inflation stops after `max_len` bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] for a corrupt gzip stream
    /// - [`Error::FrameTooLarge`] if the inflated document exceeds `max_len`
    pub fn into_json(self, max_len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Plain(bytes) => Ok(bytes),
            Self::Compressed(bytes) => {
                let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(1);
                let mut out = Vec::with_capacity(bytes.len().saturating_mul(4).min(max_len));
                GzDecoder::new(bytes.as_slice()).take(limit).read_to_end(&mut out)?;

                if out.len() > max_len {
                    return Err(Error::FrameTooLarge {
                        len: out.len(),
                        max: max_len,
                    });
                }
                Ok(out)
            }
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Appends one frame (prefix and payload) for `json` to `out`.
///
/// # Errors
///
/// - [`Error::Io`] if compression fails
/// - [`Error::FrameTooLarge`] if the payload exceeds [`MAX_FRAME_LEN`]
pub fn encode_frame(json: &[u8], threshold: usize, out: &mut Vec<u8>) -> Result<()> {
    let payload = Payload::encode(json.to_vec(), threshold)?;
    let bytes = payload.as_bytes();

    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }

    // Bounded by MAX_FRAME_LEN, which fits in u32.
    let len = bytes.len() as u32;
    out.reserve(LENGTH_PREFIX_LEN + bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

// ============================================================================
// FrameDecoder
// ============================================================================

/// Incremental decoder for a length-prefixed byte stream.
///
/// Feed arbitrary chunks with [`push`](Self::push) and drain complete frames
/// with [`next_frame`](Self::next_frame).
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder with the default frame limit.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Creates a decoder with a custom frame limit.
    #[inline]
    #[must_use]
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Returns the frame limit, applied to both wire and inflated size.
    #[inline]
    #[must_use]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Appends received bytes.
    #[inline]
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of buffered, undecoded bytes.
    #[inline]
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] as soon as a header declares more
    /// than the limit. The stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> Result<Option<Payload>> {
        let Some(header) = self.buf.first_chunk::<LENGTH_PREFIX_LEN>() else {
            return Ok(None);
        };

        let len = u32::from_le_bytes(*header) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let end = LENGTH_PREFIX_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let body = self.buf[LENGTH_PREFIX_LEN..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(Payload::classify(body)))
    }
}

// ============================================================================
// Tests
// ============================================================================
